//! Server discovery from a `p4tickets.txt`-style ticket file.
//!
//! Each useful line has the form `server=user:ticket`. Lines that don't look
//! like tickets (too short, or missing either separator) are ignored.

use crate::error::{ErrorKind, Result};
use std::path::Path;

/// Lines at or below this length cannot hold a ticket.
const MIN_LINE_LENGTH: usize = 32;

/// A known server and the users that hold tickets for it, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub display_name: String,
    pub address: String,
    /// `(user, ticket)` pairs.
    pub users_with_tickets: Vec<(String, String)>,
}
impl ServerInfo {
    /// The user that most recently obtained a ticket, if any.
    pub fn default_user(&self) -> Option<&str> {
        self.users_with_tickets.first().map(|(user, _)| user.as_str())
    }
}

/// De-duplicated list of servers discovered from ticket files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Servers(Vec<ServerInfo>);

impl Servers {
    /// Read and parse a ticket file. A file that doesn't exist yields an empty
    /// list.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No ticket file found");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(ErrorKind::Io)?;
        Ok(Self::parse(&contents))
    }

    pub fn parse(contents: &str) -> Self {
        let mut servers = Self::default();
        for line in contents.lines().map(str::trim) {
            if line.len() <= MIN_LINE_LENGTH || !line.contains('=') || !line.contains(':') {
                continue;
            }
            let Some((server, credentials)) = line.split_once('=') else {
                continue;
            };
            if credentials.contains('=') {
                continue;
            }
            let Some((user, ticket)) = credentials.split_once(':') else {
                continue;
            };
            if ticket.contains(':') {
                continue;
            }
            servers.add(server, server, Some((user, ticket)));
        }
        servers
    }

    /// Add a server, merging with an existing entry matched case-insensitively
    /// by display name or address. Returns `true` if the list changed shape
    /// (new server, or a renamed one).
    pub fn add(&mut self, display_name: &str, address: &str, ticket: Option<(&str, &str)>) -> bool {
        let by_name = self.0.iter().position(|s| s.display_name.eq_ignore_ascii_case(display_name));
        let by_address = self.0.iter().position(|s| s.address.eq_ignore_ascii_case(address));
        let ticket = ticket.filter(|(user, _)| !user.is_empty()).map(|(u, t)| (u.to_string(), t.to_string()));

        let index = match (by_name, by_address) {
            (None, None) => {
                self.0.push(ServerInfo {
                    display_name: display_name.to_string(),
                    address: address.to_string(),
                    users_with_tickets: ticket.into_iter().collect(),
                });
                return true;
            },
            (Some(index), _) => index,
            (None, Some(index)) => index,
        };

        let mut updated = false;
        if display_name != address {
            match (by_name, by_address) {
                (None, Some(index)) => {
                    self.0[index].display_name = display_name.to_string();
                    updated = true;
                },
                (Some(index), None) => self.0[index].address = address.to_string(),
                _ => {},
            }
        }
        if let Some(ticket) = ticket {
            self.0[index].users_with_tickets.insert(0, ticket);
        }
        updated
    }

    /// Find a server by address (case-insensitive).
    pub fn find(&self, address: &str) -> Option<&ServerInfo> {
        self.0.iter().find(|s| s.address.eq_ignore_ascii_case(address))
    }

    /// The stored ticket for `user` on `address`, or an empty string.
    pub fn ticket_for(&self, address: &str, user: &str) -> String {
        self.find(address)
            .and_then(|server| server.users_with_tickets.iter().find(|(u, _)| u.eq_ignore_ascii_case(user)))
            .map(|(_, ticket)| ticket.clone())
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServerInfo> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const TICKETS: &str = "\
perforce:1666=alice:0123456789ABCDEF0123456789ABCDEF
perforce:1666=bob:FEDCBA9876543210FEDCBA9876543210
PERFORCE:1666=carol:00000000000000000000000000000000
short=x:y
10.0.0.5:1666=alice:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA
";

    #[test]
    fn test_parse_deduplicates_servers() {
        let servers = Servers::parse(TICKETS);
        assert_eq!(servers.len(), 2);
        let main = servers.find("perforce:1666").unwrap();
        // Newest ticket first.
        assert_eq!(main.default_user(), Some("carol"));
        assert_eq!(main.users_with_tickets.len(), 3);
    }

    #[rstest]
    #[case("perforce:1666", "alice", "0123456789ABCDEF0123456789ABCDEF")]
    #[case("PERFORCE:1666", "BOB", "FEDCBA9876543210FEDCBA9876543210")]
    #[case("10.0.0.5:1666", "alice", "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA")]
    #[case("perforce:1666", "dave", "")]
    #[case("unknown:1666", "alice", "")]
    fn test_ticket_for(#[case] address: &str, #[case] user: &str, #[case] expected: &str) {
        assert_eq!(Servers::parse(TICKETS).ticket_for(address, user), expected);
    }

    #[test]
    fn test_add_renames_server_found_by_address() {
        let mut servers = Servers::parse(TICKETS);
        assert!(servers.add("Main", "perforce:1666", None));
        assert_eq!(servers.find("perforce:1666").unwrap().display_name, "Main");
        assert!(!servers.add("Main", "perforce:1666", Some(("erin", "T"))));
        assert_eq!(servers.find("perforce:1666").unwrap().default_user(), Some("erin"));
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let servers = Servers::from_file(dir.path().join("p4tickets.txt")).unwrap();
        assert!(servers.is_empty());
    }
}
