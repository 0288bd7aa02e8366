//! Stateless parse/serialize of the IRC line format.
//!
//! Lines follow `[':' source SP] command SP *( middle SP ) [':' trailing]`,
//! with the trailing parameter free to contain spaces. The source decomposes
//! as `nick ['!' ident] ['@' host]`.

use std::fmt;

/// Parsed message source (`nick!ident@host`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Prefix {
    pub full: String,
    pub name: String,
    pub ident: String,
    pub host: String,
}

impl Prefix {
    /// Split a raw source into nick, ident and host. Missing pieces stay
    /// empty.
    pub fn parse(raw: &str) -> Self {
        let full = raw.to_string();
        let mut rest = raw;
        let mut host = String::new();
        let mut ident = String::new();
        if let Some(at) = rest.find('@') {
            host = rest[at + 1..].to_string();
            rest = &rest[..at];
        }
        if let Some(bang) = rest.find('!') {
            ident = rest[bang + 1..].to_string();
            rest = &rest[..bang];
        }
        Self {
            full,
            name: rest.to_string(),
            ident,
            host,
        }
    }
}

/// One parsed IRC line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub source: Option<Prefix>,
    pub command: String,
    pub params: Vec<String>,
}

impl Message {
    /// Parse a raw line. Returns `None` for lines with no command.
    pub fn parse(line: &str) -> Option<Message> {
        let mut source: Option<&str> = None;
        let mut command: Option<&str> = None;
        let mut params: Vec<String> = Vec::new();
        // 0 = expecting source or command, 1 = expecting command,
        // 2 = middles, 3 = inside trailing
        let mut stage = 0u8;

        for word in line.split(' ') {
            if stage < 3 && word.is_empty() {
                continue;
            }
            match stage {
                0 => {
                    if let Some(src) = word.strip_prefix(':') {
                        source = Some(src);
                        stage = 1;
                    } else {
                        command = Some(word);
                        stage = 2;
                    }
                }
                1 => {
                    command = Some(word);
                    stage = 2;
                }
                2 => {
                    if let Some(trailing) = word.strip_prefix(':') {
                        params.push(trailing.to_string());
                        stage = 3;
                    } else {
                        params.push(word.to_string());
                    }
                }
                _ => {
                    // Trailing keeps its spaces, including runs of them.
                    let last = params.last_mut()?;
                    last.push(' ');
                    last.push_str(word);
                }
            }
        }

        Some(Message {
            source: source.filter(|s| !s.is_empty()).map(Prefix::parse),
            command: command?.to_string(),
            params,
        })
    }

    /// Serialize back to wire form. A parameter containing a space, starting
    /// with `:`, or empty is written as the trailing parameter with a leading
    /// `:`; callers keep such a parameter last.
    pub fn to_line(&self) -> String {
        let mut line = String::new();
        if let Some(source) = &self.source {
            line.push(':');
            line.push_str(&source.full);
            line.push(' ');
        }
        line.push_str(&self.command);
        for param in &self.params {
            line.push(' ');
            if param.is_empty() || param.contains(' ') || param.starts_with(':') {
                line.push(':');
            }
            line.push_str(param);
        }
        line
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

/// Build an outbound command line. Empty parameters are skipped; a parameter
/// containing a space or starting with `:` is quoted with a leading `:`.
pub fn build_line(command: &str, params: &[&str]) -> String {
    let mut line = String::from(command);
    for param in params {
        if param.is_empty() {
            continue;
        }
        line.push(' ');
        if param.contains(' ') || param.starts_with(':') {
            line.push(':');
        }
        line.push_str(param);
    }
    line
}
