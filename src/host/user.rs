//! User and role tables: password storage, role→ability inheritance.

use crate::host::route::DigestAlgorithm;
use std::collections::{HashMap, HashSet};

/// How a user's password is stored.
#[derive(Debug, Clone)]
pub enum PasswordHash {
    /// bcrypt hash, verified via `bcrypt::verify`.
    Bcrypt(String),
    /// `H(username:realm:password)` as lowercase hex, for Digest auth.
    Digest {
        hash: String,
        algorithm: DigestAlgorithm,
    },
}

impl PasswordHash {
    /// Wraps a bcrypt hash, as produced by `bcrypt::hash`.
    pub fn bcrypt(hash: impl Into<String>) -> Self {
        Self::Bcrypt(hash.into())
    }

    /// Wraps a precomputed `H(username:realm:password)` digest hash.
    pub fn digest(hash: impl Into<String>, algorithm: DigestAlgorithm) -> Self {
        Self::Digest { hash: hash.into(), algorithm }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct User {
    pub(crate) username: String,
    pub(crate) password: PasswordHash,
    pub(crate) role: String,
}

/// A named role granting a set of abilities. Roles may extend other roles;
/// the ability set is transitively expanded at [`RoleTable::build`] time.
pub struct RoleConfig {
    pub(crate) name: String,
    pub(crate) abilities: Vec<String>,
    pub(crate) extends: Vec<String>,
}

impl RoleConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            abilities: Vec::new(),
            extends: Vec::new(),
        }
    }

    pub fn ability(mut self, ability: impl Into<String>) -> Self {
        self.abilities.push(ability.into());
        self
    }

    pub fn extends(mut self, role: impl Into<String>) -> Self {
        self.extends.push(role.into());
        self
    }
}

/// A role's `extends` chain forms a cycle; [`RoleTable::build`] rejects the
/// whole table rather than silently truncating the ability set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleCycleError(pub(crate) String);

impl std::fmt::Display for RoleCycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "role inheritance cycle detected at {:?}", self.0)
    }
}

impl std::error::Error for RoleCycleError {}

pub(crate) struct RoleTable {
    // role name -> fully expanded ability set
    abilities: HashMap<String, HashSet<String>>,
}

impl RoleTable {
    pub(crate) fn build(roles: Vec<RoleConfig>) -> Result<Self, RoleCycleError> {
        let direct: HashMap<&str, &RoleConfig> =
            roles.iter().map(|r| (r.name.as_str(), r)).collect();

        let mut resolved = HashMap::with_capacity(roles.len());
        for role in &roles {
            let mut visiting = HashSet::new();
            let set = expand(&role.name, &direct, &mut visiting)?;
            resolved.insert(role.name.clone(), set);
        }

        Ok(Self { abilities: resolved })
    }

    pub(crate) fn abilities(&self, role: &str) -> Option<&HashSet<String>> {
        self.abilities.get(role)
    }

    pub(crate) fn has_ability(&self, role: &str, ability: &str) -> bool {
        self.abilities
            .get(role)
            .is_some_and(|set| set.contains(ability))
    }
}

fn expand(
    name: &str,
    direct: &HashMap<&str, &RoleConfig>,
    visiting: &mut HashSet<String>,
) -> Result<HashSet<String>, RoleCycleError> {
    if !visiting.insert(name.to_owned()) {
        return Err(RoleCycleError(name.to_owned()));
    }

    let role = direct.get(name).ok_or_else(|| RoleCycleError(name.to_owned()))?;
    let mut set: HashSet<String> = role.abilities.iter().cloned().collect();

    for parent in &role.extends {
        set.extend(expand(parent, direct, visiting)?);
    }

    visiting.remove(name);
    Ok(set)
}

pub(crate) struct UserTable {
    users: HashMap<String, User>,
}

impl UserTable {
    pub(crate) fn new(users: Vec<User>) -> Self {
        Self {
            users: users.into_iter().map(|u| (u.username.clone(), u)).collect(),
        }
    }

    pub(crate) fn get(&self, username: &[u8]) -> Option<&User> {
        let username = std::str::from_utf8(username).ok()?;
        self.users.get(username)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_simple_role() {
        let roles = vec![RoleConfig::new("admin").ability("read").ability("write")];
        let table = RoleTable::build(roles).unwrap();
        assert!(table.has_ability("admin", "read"));
        assert!(table.has_ability("admin", "write"));
        assert!(!table.has_ability("admin", "delete"));
    }

    #[test]
    fn transitively_expands_extends() {
        let roles = vec![
            RoleConfig::new("viewer").ability("read"),
            RoleConfig::new("editor").ability("write").extends("viewer"),
            RoleConfig::new("admin").ability("delete").extends("editor"),
        ];
        let table = RoleTable::build(roles).unwrap();
        assert!(table.has_ability("admin", "read"));
        assert!(table.has_ability("admin", "write"));
        assert!(table.has_ability("admin", "delete"));
    }

    #[test]
    fn rejects_cycles() {
        let roles = vec![
            RoleConfig::new("a").extends("b"),
            RoleConfig::new("b").extends("a"),
        ];
        assert!(RoleTable::build(roles).is_err());
    }
}
