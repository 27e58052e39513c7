//! Cache namespace naming: roles, versions and the `<prefix>-<role>-<version>` layout.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;

/// Logical partition a cached response belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  Static,
  Api,
  Image,
  Font,
  Misc,
}

impl Role {
  pub const ALL: [Role; 5] = [Role::Static, Role::Api, Role::Image, Role::Font, Role::Misc];

  pub fn as_str(&self) -> &'static str {
    match self {
      Role::Static => "static",
      Role::Api => "api",
      Role::Image => "image",
      Role::Font => "font",
      Role::Misc => "misc",
    }
  }
}

impl fmt::Display for Role {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// The current cache name for every role.
///
/// Built once at startup from configuration and handed to the namespace
/// manager, so nothing downstream reads version constants on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNames {
  prefix: String,
  names: BTreeMap<Role, String>,
}

impl CacheNames {
  /// Build names for all roles. `overrides` replaces `version` for individual roles.
  pub fn new(prefix: &str, version: &str, overrides: &BTreeMap<Role, String>) -> Self {
    let names = Role::ALL
      .iter()
      .map(|role| {
        let version = overrides.get(role).map(String::as_str).unwrap_or(version);
        (*role, format!("{}-{}-{}", prefix, role, version))
      })
      .collect();

    Self {
      prefix: prefix.to_string(),
      names,
    }
  }

  /// Current namespace name for a role.
  pub fn name(&self, role: Role) -> &str {
    // Every role is populated in `new`.
    self.names.get(&role).map(String::as_str).unwrap_or_default()
  }

  /// Whether `name` is one of the current namespaces.
  pub fn is_current(&self, name: &str) -> bool {
    self.names.values().any(|n| n == name)
  }

  /// Whether `name` belongs to this product, whatever its version.
  pub fn is_owned(&self, name: &str) -> bool {
    name
      .strip_prefix(&self.prefix)
      .is_some_and(|rest| rest.starts_with('-'))
  }
}
