//! Typed registry of locally cached collections.

use std::fmt;
use std::str::FromStr;

/// Every collection the local store manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
  Events,
  Classrooms,
  Students,
  Attendance,
}

/// Static description of how a collection is stored and synced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionDescriptor {
  /// Name used for rows in the local store.
  pub store_name: &'static str,
  /// Table name the remote ledger tracks modifications under.
  pub remote_table: &'static str,
  /// Whether records carry a scope index (used by the frequency governor).
  pub scoped: bool,
}

impl Collection {
  pub const ALL: [Collection; 4] = [
    Collection::Events,
    Collection::Classrooms,
    Collection::Students,
    Collection::Attendance,
  ];

  pub const fn descriptor(self) -> CollectionDescriptor {
    match self {
      Collection::Events => CollectionDescriptor {
        store_name: "events",
        remote_table: "calendar_events",
        scoped: false,
      },
      Collection::Classrooms => CollectionDescriptor {
        store_name: "classrooms",
        remote_table: "classrooms",
        scoped: false,
      },
      Collection::Students => CollectionDescriptor {
        store_name: "students",
        remote_table: "classroom_students",
        scoped: false,
      },
      Collection::Attendance => CollectionDescriptor {
        store_name: "attendance",
        remote_table: "attendance_records",
        scoped: true,
      },
    }
  }

  pub const fn store_name(self) -> &'static str {
    self.descriptor().store_name
  }

  pub const fn remote_table(self) -> &'static str {
    self.descriptor().remote_table
  }
}

impl fmt::Display for Collection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.store_name())
  }
}

impl FromStr for Collection {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Collection::ALL
      .into_iter()
      .find(|c| c.store_name().eq_ignore_ascii_case(s.trim()))
      .ok_or_else(|| format!("unknown collection '{}'", s))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_store_names_are_unique() {
    let mut names: Vec<_> = Collection::ALL.iter().map(|c| c.store_name()).collect();
    names.sort();
    names.dedup();
    assert_eq!(names.len(), Collection::ALL.len());
  }

  #[test]
  fn test_parse_round_trip() {
    for c in Collection::ALL {
      assert_eq!(c.to_string().parse::<Collection>(), Ok(c));
    }
    assert_eq!("Events".parse::<Collection>(), Ok(Collection::Events));
    assert!("grades".parse::<Collection>().is_err());
  }

  #[test]
  fn test_only_attendance_is_scoped() {
    assert!(Collection::Attendance.descriptor().scoped);
    assert!(!Collection::Events.descriptor().scoped);
  }
}
