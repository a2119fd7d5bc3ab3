//! Tokenizer for the Python subset: indentation → Indent/Dedent, implicit line
//! joining inside brackets, backslash continuation, all string prefixes.

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LexError {
    #[error("line {line}: unterminated string literal")]
    UnterminatedString { line: usize },
    #[error("line {line}: unindent does not match any outer indentation level")]
    InconsistentDedent { line: usize },
    #[error("line {line}: unexpected character {ch:?}")]
    UnexpectedChar { line: usize, ch: char },
}

// longest first so greedy matching works
const OPERATORS: &[&str] = &[
    "**=", "//=", ">>=", "<<=", "...", "->", ":=", "**", "//", "<<", ">>", "<=", ">=", "==",
    "!=", "+=", "-=", "*=", "/=", "%=", "&=", "|=", "^=", "@=", "+", "-", "*", "/", "%", "@",
    "&", "|", "^", "~", "<", ">", "(", ")", "[", "]", "{", "}", ",", ":", ".", ";", "=", "!",
];

const TAB_WIDTH: usize = 8;

pub fn tokenize(src: &str) -> Result<Vec<Token>, LexError> {
    Lexer::new(src).run()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    depth: usize,
    indents: Vec<usize>,
    out: Vec<Token>,
}

impl Lexer {
    fn new(src: &str) -> Self {
        Self {
            chars: src.chars().collect(),
            pos: 0,
            line: 1,
            depth: 0,
            indents: vec![0],
            out: Vec::new(),
        }
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn push(&mut self, tok: Tok) {
        self.out.push(Token { tok, line: self.line });
    }

    fn last_is_newline(&self) -> bool {
        matches!(self.out.last().map(|t| &t.tok), None | Some(Tok::Newline) | Some(Tok::Indent) | Some(Tok::Dedent))
    }

    fn run(mut self) -> Result<Vec<Token>, LexError> {
        let mut at_line_start = true;
        loop {
            if at_line_start && self.depth == 0 {
                if !self.indentation()? {
                    break;
                }
                at_line_start = false;
            }
            let Some(c) = self.peek(0) else { break };
            match c {
                '\n' => {
                    self.pos += 1;
                    if self.depth == 0 {
                        if !self.last_is_newline() {
                            self.push(Tok::Newline);
                        }
                        at_line_start = true;
                    }
                    self.line += 1;
                }
                '#' => self.skip_comment(),
                '\\' if self.peek(1) == Some('\n') => {
                    self.pos += 2;
                    self.line += 1;
                }
                '\\' if self.peek(1) == Some('\r') && self.peek(2) == Some('\n') => {
                    self.pos += 3;
                    self.line += 1;
                }
                ' ' | '\t' | '\r' | '\x0c' => self.pos += 1,
                '"' | '\'' => self.string(false)?,
                c if c.is_ascii_digit() => self.number(),
                '.' if self.peek(1).is_some_and(|d| d.is_ascii_digit()) => self.number(),
                c if c == '_' || c.is_alphabetic() => self.name_or_prefixed_string()?,
                _ => self.operator()?,
            }
        }
        if !self.last_is_newline() {
            self.push(Tok::Newline);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Tok::Dedent);
        }
        self.push(Tok::Eof);
        Ok(self.out)
    }

    /// Measure the indentation of the next logical line and emit Indent/Dedent.
    /// Blank and comment-only lines are consumed. Returns false at EOF.
    fn indentation(&mut self) -> Result<bool, LexError> {
        loop {
            let mut col = 0usize;
            while let Some(c) = self.peek(0) {
                match c {
                    ' ' => col += 1,
                    '\t' => col = (col / TAB_WIDTH + 1) * TAB_WIDTH,
                    '\x0c' | '\r' => {}
                    _ => break,
                }
                self.pos += 1;
            }
            match self.peek(0) {
                None => return Ok(false),
                Some('\n') => {
                    self.pos += 1;
                    self.line += 1;
                    continue;
                }
                Some('#') => {
                    self.skip_comment();
                    continue;
                }
                Some(_) => {}
            }
            let top = *self.indents.last().unwrap_or(&0);
            if col > top {
                self.indents.push(col);
                self.push(Tok::Indent);
            } else if col < top {
                while self.indents.last().is_some_and(|&i| i > col) {
                    self.indents.pop();
                    self.push(Tok::Dedent);
                }
                if self.indents.last() != Some(&col) {
                    return Err(LexError::InconsistentDedent { line: self.line });
                }
            }
            return Ok(true);
        }
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek(0) {
            if c == '\n' {
                break;
            }
            self.pos += 1;
        }
    }

    fn operator(&mut self) -> Result<(), LexError> {
        for op in OPERATORS {
            let len = op.chars().count();
            let matches = op.chars().enumerate().all(|(i, oc)| self.peek(i) == Some(oc));
            if matches {
                match *op {
                    "(" | "[" | "{" => self.depth += 1,
                    ")" | "]" | "}" => self.depth = self.depth.saturating_sub(1),
                    _ => {}
                }
                self.pos += len;
                self.push(Tok::Op(op));
                return Ok(());
            }
        }
        Err(LexError::UnexpectedChar { line: self.line, ch: self.chars[self.pos] })
    }

    fn name_or_prefixed_string(&mut self) -> Result<(), LexError> {
        let start = self.pos;
        while self.peek(0).is_some_and(|c| c == '_' || c.is_alphanumeric()) {
            self.pos += 1;
        }
        let word: String = self.chars[start..self.pos].iter().collect();
        let is_prefix = word.len() <= 2
            && word.chars().all(|c| matches!(c.to_ascii_lowercase(), 'r' | 'b' | 'u' | 'f'));
        if is_prefix && matches!(self.peek(0), Some('"') | Some('\'')) {
            let raw = word.chars().any(|c| c.eq_ignore_ascii_case(&'r'));
            return self.string(raw);
        }
        self.push(Tok::Name(word));
        Ok(())
    }

    fn string(&mut self, raw: bool) -> Result<(), LexError> {
        let start_line = self.line;
        let quote = self.chars[self.pos];
        let triple = self.peek(1) == Some(quote) && self.peek(2) == Some(quote);
        self.pos += if triple { 3 } else { 1 };
        let mut text = String::new();
        loop {
            let Some(c) = self.peek(0) else {
                return Err(LexError::UnterminatedString { line: start_line });
            };
            if c == quote {
                if !triple {
                    self.pos += 1;
                    break;
                }
                if self.peek(1) == Some(quote) && self.peek(2) == Some(quote) {
                    self.pos += 3;
                    break;
                }
            }
            if c == '\n' {
                if !triple {
                    return Err(LexError::UnterminatedString { line: start_line });
                }
                self.line += 1;
            }
            if c == '\\' {
                let Some(next) = self.peek(1) else {
                    return Err(LexError::UnterminatedString { line: start_line });
                };
                self.pos += 2;
                if next == '\n' {
                    self.line += 1;
                }
                if raw {
                    text.push('\\');
                    text.push(next);
                } else {
                    self.escape(next, &mut text);
                }
                continue;
            }
            text.push(c);
            self.pos += 1;
        }
        self.out.push(Token { tok: Tok::Str(text), line: start_line });
        Ok(())
    }

    fn escape(&mut self, next: char, text: &mut String) {
        match next {
            '\n' => {}
            'n' => text.push('\n'),
            't' => text.push('\t'),
            'r' => text.push('\r'),
            '0' => text.push('\0'),
            '\\' | '\'' | '"' => text.push(next),
            'x' => self.hex_escape(2, text, 'x'),
            'u' => self.hex_escape(4, text, 'u'),
            'U' => self.hex_escape(8, text, 'U'),
            other => {
                text.push('\\');
                text.push(other);
            }
        }
    }

    fn hex_escape(&mut self, digits: usize, text: &mut String, marker: char) {
        let hex: String = (0..digits).filter_map(|i| self.peek(i)).collect();
        match u32::from_str_radix(&hex, 16).ok().filter(|_| hex.len() == digits).and_then(char::from_u32) {
            Some(ch) => {
                text.push(ch);
                self.pos += digits;
            }
            None => {
                text.push('\\');
                text.push(marker);
            }
        }
    }

    fn number(&mut self) {
        let start = self.pos;
        if self.peek(0) == Some('0') && self.peek(1).is_some_and(|c| matches!(c, 'x' | 'X' | 'o' | 'O' | 'b' | 'B')) {
            let radix = match self.peek(1).map(|c| c.to_ascii_lowercase()) {
                Some('x') => 16,
                Some('o') => 8,
                _ => 2,
            };
            self.pos += 2;
            let digits_start = self.pos;
            while self.peek(0).is_some_and(|c| c.is_ascii_hexdigit() || c == '_') {
                self.pos += 1;
            }
            let digits: String = self.chars[digits_start..self.pos].iter().filter(|c| **c != '_').collect();
            let tok = i64::from_str_radix(&digits, radix).map(Tok::Int).unwrap_or(Tok::Float(f64::NAN));
            self.push(tok);
            return;
        }
        let mut is_float = false;
        while let Some(c) = self.peek(0) {
            if c.is_ascii_digit() || c == '_' {
                self.pos += 1;
            } else if c == '.' && !is_float {
                is_float = true;
                self.pos += 1;
            } else if (c == 'e' || c == 'E')
                && (self.peek(1).is_some_and(|d| d.is_ascii_digit())
                    || (matches!(self.peek(1), Some('+') | Some('-')) && self.peek(2).is_some_and(|d| d.is_ascii_digit())))
            {
                is_float = true;
                self.pos += 2;
            } else {
                break;
            }
        }
        let text: String = self.chars[start..self.pos].iter().filter(|c| **c != '_').collect();
        // imaginary literals have no spec meaning; keep the magnitude
        if self.peek(0).is_some_and(|c| c == 'j' || c == 'J') {
            self.pos += 1;
            is_float = true;
        }
        let tok = if is_float {
            Tok::Float(text.parse().unwrap_or(f64::NAN))
        } else {
            match text.parse::<i64>() {
                Ok(i) => Tok::Int(i),
                Err(_) => Tok::Float(text.parse().unwrap_or(f64::NAN)),
            }
        };
        self.push(tok);
    }
}

// ------------------------------- Tests ------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Tok> {
        tokenize(src).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn indentation_produces_indent_and_dedent() {
        let t = toks("def main():\n    x = 1\n\n    # note\n    return x\ny = 2\n");
        assert_eq!(t.iter().filter(|t| **t == Tok::Indent).count(), 1);
        assert_eq!(t.iter().filter(|t| **t == Tok::Dedent).count(), 1);
        assert_eq!(t.last(), Some(&Tok::Eof));
    }

    #[test]
    fn newlines_inside_brackets_are_joined() {
        let t = toks("spec = dict(\n    name=dict(type='str'),\n)\n");
        assert_eq!(t.iter().filter(|t| **t == Tok::Newline).count(), 1);
    }

    #[test]
    fn strings_with_prefixes_and_triple_quotes() {
        let t = toks("a = r'\\d+'\nb = '''multi\nline'''\nc = 'it\\'s'\n");
        assert!(t.contains(&Tok::Str("\\d+".into())));
        assert!(t.contains(&Tok::Str("multi\nline".into())));
        assert!(t.contains(&Tok::Str("it's".into())));
    }

    #[test]
    fn numbers() {
        let t = toks("x = [1, 2.5, 0x10, 1_000, 1e3]\n");
        assert!(t.contains(&Tok::Int(1)));
        assert!(t.contains(&Tok::Float(2.5)));
        assert!(t.contains(&Tok::Int(16)));
        assert!(t.contains(&Tok::Int(1000)));
        assert!(t.contains(&Tok::Float(1000.0)));
    }

    #[test]
    fn unterminated_string_is_an_error() {
        assert!(matches!(tokenize("x = 'abc\n"), Err(LexError::UnterminatedString { line: 1 })));
    }

    #[test]
    fn bad_dedent_is_an_error() {
        let err = tokenize("if x:\n        a = 1\n    b = 2\n").unwrap_err();
        assert_eq!(err, LexError::InconsistentDedent { line: 3 });
    }
}
