//! Sender blocklist.
//!
//! A precomputed set of lowercase addresses, loaded from a simple
//! externally-edited text file (one address per line, `#` comments). The
//! engine consults it before contacting a target; a blocked message is
//! marked delivered without any call reaching the target.

use std::collections::HashSet;
use std::path::Path;

/// Precomputed set of blocked sender addresses.
#[derive(Debug, Clone, Default)]
pub struct Blocklist {
    addresses: HashSet<String>,
}

impl Blocklist {
    /// Loads the blocklist file. A missing file is an empty blocklist.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Ok(Self::parse(&text))
    }

    /// Parses blocklist text: one address per line, full-line and trailing
    /// `#` comments, addresses normalized to lowercase.
    pub fn parse(text: &str) -> Self {
        let mut addresses = HashSet::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = match line.split_once('#') {
                Some((before, _)) => before.trim(),
                None => line,
            };
            if line.is_empty() {
                continue;
            }
            addresses.insert(line.to_lowercase());
        }
        Self { addresses }
    }

    /// Builds a blocklist from addresses directly.
    pub fn from_addresses<I: IntoIterator<Item = S>, S: Into<String>>(addresses: I) -> Self {
        Self {
            addresses: addresses
                .into_iter()
                .map(|a| a.into().to_lowercase())
                .collect(),
        }
    }

    /// Number of blocked addresses.
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    /// Whether the blocklist is empty.
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Whether a bare address is blocked.
    pub fn is_blocked(&self, address: &str) -> bool {
        !self.addresses.is_empty() && self.addresses.contains(&address.to_lowercase())
    }

    /// Whether a From header value names a blocked address.
    pub fn matches_from(&self, from_header: &str) -> bool {
        if self.addresses.is_empty() {
            return false;
        }
        match extract_address(from_header) {
            Some(addr) => self.is_blocked(&addr),
            None => false,
        }
    }
}

/// Extracts the bare email address from a From header value like
/// `Name <addr@example.com>`.
pub fn extract_address(from_header: &str) -> Option<String> {
    let parsed = mailparse::addrparse(from_header).ok()?;
    for addr in parsed.iter() {
        match addr {
            mailparse::MailAddr::Single(info) => return Some(info.addr.to_lowercase()),
            mailparse::MailAddr::Group(group) => {
                if let Some(member) = group.addrs.first() {
                    return Some(member.addr.to_lowercase());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_skips_comments_and_blanks() {
        let text = "\
# header comment
spammer@example.com # added on 2026-01-15, sends junk

OTHER@Example.Com
#another comment
   # indented comment
";
        let blocklist = Blocklist::parse(text);
        assert_eq!(blocklist.len(), 2);
        assert!(blocklist.is_blocked("spammer@example.com"));
        assert!(blocklist.is_blocked("other@example.com"));
    }

    #[test]
    fn is_blocked_is_case_insensitive() {
        let blocklist = Blocklist::from_addresses(["Spammer@Example.Com"]);
        assert!(blocklist.is_blocked("spammer@example.com"));
        assert!(blocklist.is_blocked("SPAMMER@EXAMPLE.COM"));
        assert!(!blocklist.is_blocked("friend@example.com"));
    }

    #[test]
    fn matches_from_extracts_address() {
        let blocklist = Blocklist::from_addresses(["spammer@example.com"]);
        assert!(blocklist.matches_from("Evil Spammer <spammer@example.com>"));
        assert!(blocklist.matches_from("spammer@example.com"));
        assert!(!blocklist.matches_from("Good Person <friend@example.com>"));
    }

    #[test]
    fn empty_blocklist_blocks_nothing() {
        let blocklist = Blocklist::default();
        assert!(!blocklist.matches_from("anyone <anyone@example.com>"));
        assert!(!blocklist.is_blocked("anyone@example.com"));
        assert!(blocklist.is_empty());
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let blocklist = Blocklist::load(&dir.path().join("blocklist.txt")).unwrap();
        assert!(blocklist.is_empty());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocklist.txt");
        std::fs::write(&path, "bad@example.com\n").unwrap();

        let blocklist = Blocklist::load(&path).unwrap();
        assert!(blocklist.is_blocked("bad@example.com"));
    }

    #[test]
    fn extract_address_handles_plain_and_named() {
        assert_eq!(
            extract_address("Alice <Alice@Example.com>").as_deref(),
            Some("alice@example.com")
        );
        assert_eq!(
            extract_address("alice@example.com").as_deref(),
            Some("alice@example.com")
        );
    }
}
