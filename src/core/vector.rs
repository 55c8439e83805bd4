//! Per-author USN version vectors.

use std::collections::BTreeMap;
use std::fmt;

use super::author::AuthorRecord;
use super::identity::AuthorId;

/// What a replica is missing relative to a peer: the peer knows
/// `author` past our local high-water mark (`None` when the author is
/// unknown locally).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Need {
    pub author: AuthorId,
    pub local_usn: Option<u64>,
}

/// Mapping from author id to the largest USN seen from that author.
///
/// Authors absent from the map read as zero. Author names are metadata
/// and never enter the vector.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VersionVector(BTreeMap<AuthorId, u64>);

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_authors<'a>(records: impl IntoIterator<Item = &'a AuthorRecord>) -> Self {
        let mut vector = Self::new();
        for record in records {
            vector.observe(record.id, record.usn);
        }
        vector
    }

    pub fn get(&self, author: &AuthorId) -> u64 {
        self.0.get(author).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AuthorId, u64)> {
        self.0.iter().map(|(author, usn)| (author, *usn))
    }

    /// Record that `usn` from `author` has been seen. Keeps the max.
    pub fn observe(&mut self, author: AuthorId, usn: u64) {
        let slot = self.0.entry(author).or_insert(0);
        if usn > *slot {
            *slot = usn;
        }
    }

    /// True iff every author known to `other` is known here at an
    /// equal or greater USN. A vector dominates itself.
    pub fn dominates(&self, other: &VersionVector) -> bool {
        other
            .0
            .iter()
            .all(|(author, theirs)| self.get(author) >= *theirs)
    }

    /// The authors `other` knows past this vector, with the local
    /// high-water mark for each (`None` when unknown locally). This is
    /// the record-selection list for merge.
    pub fn need_list(&self, other: &VersionVector) -> Vec<Need> {
        other
            .0
            .iter()
            .filter(|(author, theirs)| self.get(author) < **theirs)
            .map(|(author, _)| Need {
                author: *author,
                local_usn: self.0.get(author).copied(),
            })
            .collect()
    }

    /// Destructive pointwise max with `other`.
    pub fn union(&mut self, other: &VersionVector) {
        for (author, usn) in &other.0 {
            self.observe(*author, *usn);
        }
    }
}

impl fmt::Display for VersionVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (author, usn)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{author}:{usn}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(pairs: &[(AuthorId, u64)]) -> VersionVector {
        let mut v = VersionVector::new();
        for (author, usn) in pairs {
            v.observe(*author, *usn);
        }
        v
    }

    #[test]
    fn vector_dominates_itself() {
        let a = AuthorId::generate();
        let v = vector(&[(a, 3)]);
        assert!(v.dominates(&v));
        assert!(VersionVector::new().dominates(&VersionVector::new()));
    }

    #[test]
    fn dominance_requires_every_author() {
        let a = AuthorId::generate();
        let b = AuthorId::generate();
        let ours = vector(&[(a, 5)]);
        let theirs = vector(&[(a, 3), (b, 1)]);
        assert!(!ours.dominates(&theirs));
        assert!(vector(&[(a, 5), (b, 1)]).dominates(&theirs));
    }

    #[test]
    fn missing_authors_read_as_zero() {
        let a = AuthorId::generate();
        let empty = VersionVector::new();
        assert_eq!(empty.get(&a), 0);
        // An explicit zero entry is dominated by an empty vector.
        assert!(empty.dominates(&vector(&[(a, 0)])));
    }

    #[test]
    fn need_list_reports_local_marks() {
        let a = AuthorId::generate();
        let b = AuthorId::generate();
        let ours = vector(&[(a, 2)]);
        let theirs = vector(&[(a, 5), (b, 1)]);

        let mut needs = ours.need_list(&theirs);
        needs.sort_by_key(|n| n.author);
        let mut expected = vec![
            Need {
                author: a,
                local_usn: Some(2),
            },
            Need {
                author: b,
                local_usn: None,
            },
        ];
        expected.sort_by_key(|n| n.author);
        assert_eq!(needs, expected);
    }

    #[test]
    fn need_list_empty_when_dominating() {
        let a = AuthorId::generate();
        let ours = vector(&[(a, 5)]);
        let theirs = vector(&[(a, 5)]);
        assert!(ours.need_list(&theirs).is_empty());
    }

    #[test]
    fn union_is_pointwise_max() {
        let a = AuthorId::generate();
        let b = AuthorId::generate();
        let mut ours = vector(&[(a, 2), (b, 9)]);
        ours.union(&vector(&[(a, 5), (b, 1)]));
        assert_eq!(ours.get(&a), 5);
        assert_eq!(ours.get(&b), 9);
        assert!(ours.dominates(&vector(&[(a, 5), (b, 1)])));
    }
}
