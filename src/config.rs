//! Roster configuration shared by the server and client binaries.

use std::path::Path;

use crate::errors::{Result, TellerError};

/// Immutable identity of one branch server, read from the roster file at
/// startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch {
    /// Branch letter (`A`–`E` in the standard deployment).
    pub name: String,
    /// Hostname or address the branch listens on.
    pub host: String,
    /// TCP port of the branch's single listening endpoint.
    pub port: u16,
}

impl Branch {
    /// The `host:port` dial string for this branch.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Reads the roster file: one branch per line, `NAME HOST PORT` separated by
/// whitespace. Lines with fewer than three fields are skipped. Roster order
/// carries no meaning.
pub fn load_roster(path: &Path) -> Result<Vec<Branch>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| TellerError::Config(format!("cannot read {}: {e}", path.display())))?;
    parse_roster(&text)
}

fn parse_roster(text: &str) -> Result<Vec<Branch>> {
    let mut roster = Vec::new();
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let (Some(name), Some(host), Some(port)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        let port = port
            .parse::<u16>()
            .map_err(|_| TellerError::Config(format!("invalid port {port:?} for branch {name}")))?;
        roster.push(Branch {
            name: name.to_string(),
            host: host.to_string(),
            port,
        });
    }
    if roster.is_empty() {
        return Err(TellerError::Config("roster file names no branches".into()));
    }
    Ok(roster)
}

/// Finds the roster entry for `name`.
pub fn find_branch<'a>(roster: &'a [Branch], name: &str) -> Result<&'a Branch> {
    roster
        .iter()
        .find(|b| b.name == name)
        .ok_or_else(|| TellerError::Config(format!("branch {name} is not in the roster")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_three_field_lines() {
        let roster = parse_roster("A 127.0.0.1 1234\nB localhost 1235\n").unwrap();
        assert_eq!(roster.len(), 2);
        assert_eq!(roster[0].name, "A");
        assert_eq!(roster[0].addr(), "127.0.0.1:1234");
        assert_eq!(roster[1].port, 1235);
    }

    #[test]
    fn skips_short_lines() {
        let roster = parse_roster("# comment\nA 127.0.0.1 1234\n\nB onlyhost\n").unwrap();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].name, "A");
    }

    #[test]
    fn rejects_bad_port() {
        assert!(parse_roster("A 127.0.0.1 notaport\n").is_err());
    }

    #[test]
    fn rejects_empty_roster() {
        assert!(parse_roster("\n\n").is_err());
    }

    #[test]
    fn finds_branch_by_name() {
        let roster = parse_roster("A h 1\nB h 2\n").unwrap();
        assert_eq!(find_branch(&roster, "B").unwrap().port, 2);
        assert!(find_branch(&roster, "Z").is_err());
    }
}
