use serde::de::DeserializeOwned;

/// Deserialize YAML with document-path context in error messages.
pub fn from_yaml_str_with_path<T: DeserializeOwned>(src: &str) -> Result<T, String> {
    let de = serde_yaml::Deserializer::from_str(src);
    match serde_path_to_error::deserialize::<_, T>(de) {
        Ok(v) => Ok(v),
        Err(err) => {
            let path = err.path().to_string();
            Err(format!("at YAML path {path} → {}", err.into_inner()))
        }
    }
}

// ------------------------------- Tests ------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn error_names_the_offending_path() {
        let err = from_yaml_str_with_path::<Vec<BTreeMap<String, Vec<String>>>>("- hosts: [a]\n- tasks: {x: 1}\n")
            .unwrap_err();
        assert!(err.starts_with("at YAML path [1].tasks"), "{err}");
    }
}
