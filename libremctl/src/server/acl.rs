// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! ACL evaluation.
//!
//! A rule carries a list of ACL references. Each resolves to a scheme
//! that, for a given principal, yields permit, deny, or no-match, or
//! fails outright. Any failure or any successful `deny:` match refuses
//! access; otherwise at least one positive match is required.

use std::{collections::HashSet, fs, path::PathBuf};

use anyhow::{anyhow, bail, Context as _};
use nix::unistd::{Group, User};
use regex::Regex;
use tracing::{debug, warn};

/// One parsed ACL reference.
///
/// Schemes that are recognized but not compiled into this build parse
/// successfully (so configurations stay loadable) and fail closed with
/// a diagnostic when evaluated.
#[derive(Debug, Clone)]
pub enum Acl {
    /// The literal `ANYUSER`, authorizing every authenticated peer.
    AnyUser,
    /// An exact principal string.
    Principal(String),
    /// A file of principal lines, evaluated recursively. Bare ACL
    /// references without a scheme are files.
    File(PathBuf),
    /// Inverts a successful inner match into a denial.
    Deny(Box<Acl>),
    /// POSIX group membership of the principal's local username.
    /// Principals with instance components have no local account and
    /// never match.
    LocalGroup(String),
    /// POSIX group membership of the principal's primary component,
    /// so `user/admin@REALM` checks the group for `user`.
    UnixGroup(String),
    /// An anchored-by-the-author regular expression over the principal.
    Regex(Box<Regex>),
    /// A scheme this build does not support (pcre, gput).
    Disabled(&'static str),
}

/// The three-valued result of checking one ACL against a principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Permit,
    Deny,
    NoMatch,
}

impl Acl {
    /// Parse one ACL reference. Unknown schemes are load-time errors;
    /// references without a colon are file paths.
    pub fn parse(s: &str) -> anyhow::Result<Acl> {
        if s == "ANYUSER" {
            return Ok(Acl::AnyUser);
        }
        let Some((scheme, value)) = s.split_once(':') else {
            return Ok(Acl::File(PathBuf::from(s)));
        };
        match scheme {
            "file" => Ok(Acl::File(PathBuf::from(value))),
            "princ" => Ok(Acl::Principal(String::from(value))),
            "deny" => Ok(Acl::Deny(Box::new(Acl::parse(value)?))),
            "localgroup" => Ok(Acl::LocalGroup(String::from(value))),
            "unxgrp" => Ok(Acl::UnixGroup(String::from(value))),
            "regex" => {
                let re = Regex::new(value)
                    .with_context(|| format!("compiling ACL regex {value}"))?;
                Ok(Acl::Regex(Box::new(re)))
            }
            "pcre" => Ok(Acl::Disabled("pcre")),
            "gput" => Ok(Acl::Disabled("gput")),
            _ => bail!("unknown ACL scheme {scheme}"),
        }
    }

    fn check(&self, principal: &str, visited: &mut HashSet<PathBuf>) -> anyhow::Result<Decision> {
        match self {
            Acl::AnyUser => Ok(Decision::Permit),
            Acl::Principal(p) => {
                if p == principal {
                    Ok(Decision::Permit)
                } else {
                    Ok(Decision::NoMatch)
                }
            }
            Acl::File(path) => check_file(path, principal, visited),
            Acl::Deny(inner) => match inner.check(principal, visited)? {
                Decision::Permit => Ok(Decision::Deny),
                Decision::Deny | Decision::NoMatch => Ok(Decision::NoMatch),
            },
            Acl::LocalGroup(group) => match principal_to_local(principal) {
                Some(user) => {
                    if localgroup_member(group, &user)? {
                        Ok(Decision::Permit)
                    } else {
                        Ok(Decision::NoMatch)
                    }
                }
                None => Ok(Decision::NoMatch),
            },
            Acl::UnixGroup(group) => match principal_primary(principal) {
                Some(user) => {
                    if localgroup_member(group, &user)? {
                        Ok(Decision::Permit)
                    } else {
                        Ok(Decision::NoMatch)
                    }
                }
                None => Ok(Decision::NoMatch),
            },
            Acl::Regex(re) => {
                if re.is_match(principal) {
                    Ok(Decision::Permit)
                } else {
                    Ok(Decision::NoMatch)
                }
            }
            Acl::Disabled(scheme) => {
                bail!("ACL scheme {scheme} is not supported by this build")
            }
        }
    }
}

/// Evaluate a rule's ACL list for a principal.
///
/// `ANYUSER` anywhere in the list wins immediately. A successful
/// `deny:` refuses access no matter what else matched, and any
/// evaluation error refuses access with a logged diagnostic.
pub fn permit(acls: &[Acl], principal: &str) -> bool {
    if acls.iter().any(|a| matches!(a, Acl::AnyUser)) {
        return true;
    }

    let mut permitted = false;
    for acl in acls {
        let mut visited = HashSet::new();
        match acl.check(principal, &mut visited) {
            Ok(Decision::Permit) => permitted = true,
            Ok(Decision::Deny) => {
                debug!("{} denied by {:?}", principal, acl);
                return false;
            }
            Ok(Decision::NoMatch) => {}
            Err(e) => {
                warn!("error evaluating ACL {:?}: {:#}", acl, e);
                return false;
            }
        }
    }
    permitted
}

/// Check an ACL file. Lines are principal literals, scheme-prefixed
/// ACL references, comments, or `include` directives (any line with
/// whitespace). The visited set breaks include cycles.
fn check_file(
    path: &PathBuf,
    principal: &str,
    visited: &mut HashSet<PathBuf>,
) -> anyhow::Result<Decision> {
    let canonical = fs::canonicalize(path)
        .with_context(|| format!("cannot open ACL file {}", path.display()))?;
    if !visited.insert(canonical) {
        bail!("ACL file {} recursively included", path.display());
    }
    let text = fs::read_to_string(path)
        .with_context(|| format!("cannot read ACL file {}", path.display()))?;

    for (i, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if line.contains(char::is_whitespace) {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() != 2 || tokens[0] != "include" {
                bail!("{}:{}: parse error in ACL file", path.display(), i + 1);
            }
            let target = PathBuf::from(tokens[1]);
            match include_targets(&target)? {
                IncludeTargets::File(file) => {
                    match check_file(&file, principal, visited)? {
                        Decision::NoMatch => {}
                        decision => return Ok(decision),
                    }
                }
                IncludeTargets::Directory(files) => {
                    for file in files {
                        match check_file(&file, principal, visited)? {
                            Decision::NoMatch => {}
                            decision => return Ok(decision),
                        }
                    }
                }
            }
        } else if line.contains(':') {
            let acl = Acl::parse(line)
                .with_context(|| format!("{}:{}: bad ACL entry", path.display(), i + 1))?;
            match acl.check(principal, visited)? {
                Decision::NoMatch => {}
                decision => return Ok(decision),
            }
        } else if line == principal {
            return Ok(Decision::Permit);
        }
    }
    Ok(Decision::NoMatch)
}

pub enum IncludeTargets {
    File(PathBuf),
    Directory(Vec<PathBuf>),
}

/// Resolve an include target: a plain file, or every entry of a
/// directory whose name contains no period. Directory entries are
/// sorted so evaluation order does not depend on readdir order.
pub fn include_targets(target: &PathBuf) -> anyhow::Result<IncludeTargets> {
    let meta = fs::metadata(target)
        .with_context(|| format!("included file {} not found", target.display()))?;
    if !meta.is_dir() {
        return Ok(IncludeTargets::File(target.clone()));
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(target)
        .with_context(|| format!("cannot read included directory {}", target.display()))?
    {
        let entry = entry.context("reading directory entry")?;
        if entry.file_name().to_string_lossy().contains('.') {
            continue;
        }
        files.push(entry.path());
    }
    files.sort();
    Ok(IncludeTargets::Directory(files))
}

/// Map a principal to a local username: strip the realm, and refuse
/// principals with instance components since they have no local
/// account.
fn principal_to_local(principal: &str) -> Option<String> {
    let user = match principal.split_once('@') {
        Some((user, _realm)) => user,
        None => principal,
    };
    if user.is_empty() || user.contains('/') {
        return None;
    }
    Some(String::from(user))
}

/// Reduce a principal to its primary component, keeping only what
/// comes before any instance and the realm. This is the looser mapping
/// the unxgrp scheme uses: `user/admin@REALM` counts as `user`.
fn principal_primary(principal: &str) -> Option<String> {
    let user = match principal.split_once('@') {
        Some((user, _realm)) => user,
        None => principal,
    };
    let user = match user.split_once('/') {
        Some((primary, _instance)) => primary,
        None => user,
    };
    if user.is_empty() {
        return None;
    }
    Some(String::from(user))
}

/// True if the user is a member of the named POSIX group, either via
/// the group's member list or as their primary group. A nonexistent
/// group is an error so a typoed configuration fails closed.
fn localgroup_member(group: &str, user: &str) -> anyhow::Result<bool> {
    let group = Group::from_name(group)
        .with_context(|| format!("looking up group {group}"))?
        .ok_or_else(|| anyhow!("group {group} does not exist"))?;
    if group.mem.iter().any(|m| m == user) {
        return Ok(true);
    }
    let user = User::from_name(user).with_context(|| format!("looking up user {user}"))?;
    Ok(user.map(|u| u.gid == group.gid).unwrap_or(false))
}

#[cfg(test)]
mod test {
    use std::io::Write as _;

    use super::*;

    fn write_file(dir: &std::path::Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = fs::File::create(&path).expect("creating ACL file");
        f.write_all(contents.as_bytes()).expect("writing ACL file");
        path
    }

    #[test]
    fn parse_schemes() {
        assert!(matches!(Acl::parse("ANYUSER"), Ok(Acl::AnyUser)));
        assert!(matches!(Acl::parse("/etc/remctl/acl/admins"), Ok(Acl::File(_))));
        assert!(matches!(Acl::parse("file:/etc/acl"), Ok(Acl::File(_))));
        assert!(matches!(Acl::parse("princ:user@EXAMPLE.ORG"), Ok(Acl::Principal(_))));
        assert!(matches!(Acl::parse("localgroup:wheel"), Ok(Acl::LocalGroup(_))));
        assert!(matches!(Acl::parse("unxgrp:wheel"), Ok(Acl::UnixGroup(_))));
        assert!(matches!(Acl::parse("regex:^user@"), Ok(Acl::Regex(_))));
        assert!(matches!(Acl::parse("pcre:^user@"), Ok(Acl::Disabled("pcre"))));
        assert!(matches!(Acl::parse("gput:admins"), Ok(Acl::Disabled("gput"))));

        let nested = Acl::parse("deny:princ:bad@EXAMPLE.ORG").expect("nested parse");
        assert!(matches!(nested, Acl::Deny(_)));

        assert!(Acl::parse("ldap:cn=admins").is_err());
        assert!(Acl::parse("regex:(unclosed").is_err());
    }

    #[test]
    fn principal_literals_and_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let acl = write_file(
            dir.path(),
            "admins",
            "# administrators\n\nuser@EXAMPLE.ORG\nother@EXAMPLE.ORG\n",
        );

        let acls = vec![Acl::File(acl)];
        assert!(permit(&acls, "user@EXAMPLE.ORG"));
        assert!(permit(&acls, "other@EXAMPLE.ORG"));
        assert!(!permit(&acls, "nobody@EXAMPLE.ORG"));
        // Comments never match, even a principal named like one.
        assert!(!permit(&acls, "# administrators"));
    }

    #[test]
    fn missing_file_fails_closed() {
        let acls = vec![Acl::File(PathBuf::from("/nonexistent/acl/file"))];
        assert!(!permit(&acls, "user@EXAMPLE.ORG"));
    }

    #[test]
    fn anyuser_permits_everyone() {
        let acls =
            vec![Acl::File(PathBuf::from("/nonexistent/acl/file")), Acl::AnyUser];
        assert!(permit(&acls, "whoever@EXAMPLE.ORG"));
    }

    #[test]
    fn deny_overrides_permit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let good = write_file(dir.path(), "good", "alice@EXAMPLE.ORG\nboth@EXAMPLE.ORG\n");
        let bad = write_file(dir.path(), "bad", "both@EXAMPLE.ORG\nevil@EXAMPLE.ORG\n");

        let acls = vec![
            Acl::File(good),
            Acl::Deny(Box::new(Acl::File(bad))),
        ];

        // In good only: permitted.
        assert!(permit(&acls, "alice@EXAMPLE.ORG"));
        // In both: the deny wins over the positive match.
        assert!(!permit(&acls, "both@EXAMPLE.ORG"));
        // In neither: no positive match.
        assert!(!permit(&acls, "nobody@EXAMPLE.ORG"));
        // In bad only: denied, not merely unmatched.
        assert!(!permit(&acls, "evil@EXAMPLE.ORG"));
    }

    #[test]
    fn deny_of_no_match_is_not_permit() {
        let acls = vec![Acl::Deny(Box::new(Acl::Principal(String::from("bad@EXAMPLE.ORG"))))];
        // Not being denied is not the same as being permitted.
        assert!(!permit(&acls, "good@EXAMPLE.ORG"));
    }

    #[test]
    fn disabled_scheme_fails_closed() {
        let acls = vec![
            Acl::Principal(String::from("user@EXAMPLE.ORG")),
            Acl::Disabled("pcre"),
        ];
        // The evaluation error denies even an otherwise matching user.
        assert!(!permit(&acls, "user@EXAMPLE.ORG"));
    }

    #[test]
    fn regex_scheme() {
        let acls = vec![Acl::parse("regex:^host/.*@EXAMPLE\\.ORG$").expect("parse")];
        assert!(permit(&acls, "host/db1@EXAMPLE.ORG"));
        assert!(!permit(&acls, "user@EXAMPLE.ORG"));
    }

    #[test]
    fn file_includes_and_cycles() {
        let dir = tempfile::tempdir().expect("tempdir");
        let inner = write_file(dir.path(), "inner", "nested@EXAMPLE.ORG\n");
        let outer = write_file(
            dir.path(),
            "outer",
            &format!("top@EXAMPLE.ORG\ninclude {}\n", inner.display()),
        );

        let acls = vec![Acl::File(outer.clone())];
        assert!(permit(&acls, "top@EXAMPLE.ORG"));
        assert!(permit(&acls, "nested@EXAMPLE.ORG"));
        assert!(!permit(&acls, "nobody@EXAMPLE.ORG"));

        // A file including itself is an evaluation error, which denies.
        let cyclic = write_file(
            dir.path(),
            "cyclic",
            &format!("include {}\nuser@EXAMPLE.ORG\n", dir.path().join("cyclic").display()),
        );
        assert!(!permit(&vec![Acl::File(cyclic)], "user@EXAMPLE.ORG"));
    }

    #[test]
    fn directory_include_skips_dotted_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let subdir = dir.path().join("acl.d");
        fs::create_dir(&subdir).expect("creating acl.d");
        write_file(&subdir, "admins", "admin@EXAMPLE.ORG\n");
        write_file(&subdir, "admins.bak", "stale@EXAMPLE.ORG\n");
        let top = write_file(
            dir.path(),
            "top",
            &format!("include {}\n", subdir.display()),
        );

        let acls = vec![Acl::File(top)];
        assert!(permit(&acls, "admin@EXAMPLE.ORG"));
        // Dotted entries (editor backups and friends) are ignored.
        assert!(!permit(&acls, "stale@EXAMPLE.ORG"));
    }

    #[test]
    fn scheme_lines_inside_acl_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let acl = write_file(
            dir.path(),
            "mixed",
            "princ:direct@EXAMPLE.ORG\nregex:^svc/.*@EXAMPLE\\.ORG$\n",
        );

        let acls = vec![Acl::File(acl)];
        assert!(permit(&acls, "direct@EXAMPLE.ORG"));
        assert!(permit(&acls, "svc/backup@EXAMPLE.ORG"));
        assert!(!permit(&acls, "nobody@EXAMPLE.ORG"));
    }

    #[test]
    fn local_name_mapping() {
        assert_eq!(principal_to_local("alice@EXAMPLE.ORG"), Some(String::from("alice")));
        assert_eq!(principal_to_local("alice"), Some(String::from("alice")));
        // Instance-bearing principals have no local account.
        assert_eq!(principal_to_local("alice/admin@EXAMPLE.ORG"), None);
        assert_eq!(principal_to_local("host/db1@EXAMPLE.ORG"), None);
        assert_eq!(principal_to_local("@EXAMPLE.ORG"), None);
    }

    #[test]
    fn primary_component_mapping() {
        // unxgrp takes the primary component, so instances still map.
        assert_eq!(principal_primary("alice@EXAMPLE.ORG"), Some(String::from("alice")));
        assert_eq!(principal_primary("alice/admin@EXAMPLE.ORG"), Some(String::from("alice")));
        assert_eq!(principal_primary("alice"), Some(String::from("alice")));
        assert_eq!(principal_primary("/admin@EXAMPLE.ORG"), None);
        assert_eq!(principal_primary("@EXAMPLE.ORG"), None);
    }
}
