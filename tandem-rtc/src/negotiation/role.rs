use std::fmt;

use tandem_core::models::PeerId;

/// Side taken when both peers offer at once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Yields: rolls back its own offer and answers the remote one
    Polite,
    /// Keeps its own offer and ignores the remote one
    Impolite,
}

impl Role {
    /// Role of `local` when negotiating with `remote`.
    ///
    /// The lexicographically greater id is polite, so the two ends of a pair
    /// always disagree. Recomputed per offer since the remote side can change.
    #[must_use]
    pub fn for_pair(local: &PeerId, remote: &PeerId) -> Self {
        if local > remote {
            Self::Polite
        } else {
            Self::Impolite
        }
    }

    #[must_use]
    pub const fn is_polite(&self) -> bool {
        matches!(self, Self::Polite)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Polite => f.write_str("polite"),
            Self::Impolite => f.write_str("impolite"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_are_complementary() {
        let pairs = [("alice", "bob"), ("b", "a"), ("sock-10", "sock-9"), ("A", "a")];
        for (a, b) in pairs {
            let a = PeerId::from(a);
            let b = PeerId::from(b);
            assert_ne!(Role::for_pair(&a, &b), Role::for_pair(&b, &a), "{a} vs {b}");
        }
    }

    #[test]
    fn test_greater_id_is_polite() {
        assert!(Role::for_pair(&PeerId::from("zed"), &PeerId::from("amy")).is_polite());
        assert!(!Role::for_pair(&PeerId::from("amy"), &PeerId::from("zed")).is_polite());
    }
}
