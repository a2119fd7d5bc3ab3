//! Convert Ansible module argument specs (and playbook variables) into
//! JSON Schema (Draft-07) documents and TOSCA node/data types.
//!
//! Pipeline: `pysrc` loads module source → `sandbox` runs its entry routine
//! against stand-in framework types → `extract` harvests the merged spec →
//! `lower` maps it onto reusable types → `emit` renders one of the targets.
//! `playbook` is an alternate producer feeding the same `lower`/`emit` stage.
pub mod cli;
pub mod convert;
pub mod emit;
pub mod error;
pub mod extract;
pub mod inference;
pub mod ir;
pub mod lower;
pub mod path_de;
pub mod playbook;
pub mod pysrc;
pub mod sandbox;

pub use convert::{convert_module, convert_playbook, Conversion, ConvertOptions};
pub use emit::OutputFormat;
pub use error::ConvertError;
pub use extract::ExtractMode;
pub use sandbox::SubstitutionEnv;
