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

//! remctl.conf parsing.
//!
//! The configuration is a line-oriented dispatch table mapping a
//! command type and subcommand to an executable, options, and ACLs:
//!
//! ```text
//! <type> <subcommand> <program> [opt=value...] <acl> [<acl>...]
//! ```
//!
//! Lines ending in a backslash continue on the next line, `#` starts a
//! comment, and `include <path>` pulls in another file (or every
//! period-free entry of a directory). The configuration is parsed once
//! at server start and immutable afterwards; unknown options and
//! unknown ACL schemes fail the load, not the eventual dispatch.

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, Context as _};
use nix::unistd::{Gid, Uid, User};
use tracing::info;

use crate::server::acl::{self, Acl};

/// Where an argument bound for the child's standard input comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdinArg {
    /// The Nth command argument, counting from 1 after the subcommand.
    Index(usize),
    /// The final argument, whatever its position.
    Last,
}

/// The user a command runs as, resolved at configuration load so a
/// typo shows up at startup rather than at dispatch.
#[derive(Debug, Clone)]
pub struct RunAsUser {
    pub name: String,
    pub uid: Uid,
    pub gid: Gid,
}

/// One dispatch rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub command: String,
    pub subcommand: String,
    pub program: PathBuf,
    /// Argument positions replaced with **MASKED** in the audit log,
    /// indexed with the type at position zero.
    pub logmask: Vec<usize>,
    pub stdin_arg: Option<StdinArg>,
    pub user: Option<RunAsUser>,
    pub summary: Option<String>,
    pub help: Option<String>,
    pub acls: Vec<Acl>,
    /// Source location for diagnostics.
    pub file: PathBuf,
    pub lineno: usize,
}

/// The parsed server configuration, immutable once loaded.
#[derive(Debug, Default)]
pub struct Config {
    pub rules: Vec<Rule>,
}

impl Config {
    /// Load a configuration file and everything it includes.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
        let mut config = Config::default();
        let mut visited = HashSet::new();
        read_conf_file(&mut config, path.as_ref(), &mut visited)?;
        info!("loaded {} rules from {}", config.rules.len(), path.as_ref().display());
        Ok(config)
    }

    /// Find the rule for a data command: first match in file order,
    /// with `ALL` as a wildcard subcommand. Rules named `help` belong
    /// to the help meta-command and never match data commands.
    pub fn find_rule(&self, command: &str, subcommand: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| {
            r.command != "help"
                && r.subcommand != "help"
                && r.command == command
                && (r.subcommand == "ALL" || r.subcommand == subcommand)
        })
    }

    /// Rules that contribute to the summary meta-command.
    pub fn summary_rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(|r| r.summary.is_some())
    }
}

fn read_conf_file(
    config: &mut Config,
    path: &Path,
    visited: &mut HashSet<PathBuf>,
) -> anyhow::Result<()> {
    let canonical = fs::canonicalize(path)
        .with_context(|| format!("cannot open config file {}", path.display()))?;
    if !visited.insert(canonical) {
        bail!("config file {} recursively included", path.display());
    }
    let text = fs::read_to_string(path)
        .with_context(|| format!("cannot read config file {}", path.display()))?;

    for (lineno, line) in logical_lines(&text) {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let tokens: Vec<&str> = trimmed.split_whitespace().collect();
        if tokens.len() == 2 && tokens[0] == "include" {
            handle_include(config, path, lineno, tokens[1], visited)?;
            continue;
        }
        if tokens.len() < 4 {
            bail!("{}:{}: parse error", path.display(), lineno);
        }

        let rule = parse_rule(&tokens, path, lineno)?;
        config.rules.push(rule);
    }
    Ok(())
}

fn handle_include(
    config: &mut Config,
    file: &Path,
    lineno: usize,
    target: &str,
    visited: &mut HashSet<PathBuf>,
) -> anyhow::Result<()> {
    let target = PathBuf::from(target);
    match acl::include_targets(&target)
        .with_context(|| format!("{}:{}: bad include", file.display(), lineno))?
    {
        acl::IncludeTargets::File(included) => read_conf_file(config, &included, visited),
        acl::IncludeTargets::Directory(entries) => {
            for included in entries {
                read_conf_file(config, &included, visited)?;
            }
            Ok(())
        }
    }
}

fn parse_rule(tokens: &[&str], file: &Path, lineno: usize) -> anyhow::Result<Rule> {
    let mut rule = Rule {
        command: String::from(tokens[0]),
        subcommand: String::from(tokens[1]),
        program: PathBuf::from(tokens[2]),
        logmask: Vec::new(),
        stdin_arg: None,
        user: None,
        summary: None,
        help: None,
        acls: Vec::new(),
        file: PathBuf::from(file),
        lineno,
    };

    let mut rest = &tokens[3..];
    while let Some(token) = rest.first() {
        let Some((key, value)) = token.split_once('=') else {
            break;
        };
        // Only bare words can be options; anything else (say a
        // principal or path with an equals sign) starts the ACLs.
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphabetic()) {
            break;
        }
        match key {
            "logmask" => {
                for position in value.split(',') {
                    let n: usize = position.parse().map_err(|_| {
                        anyhow!("{}:{}: bad logmask value {value}", file.display(), lineno)
                    })?;
                    rule.logmask.push(n);
                }
            }
            "stdin" => {
                rule.stdin_arg = Some(if value == "last" {
                    StdinArg::Last
                } else {
                    let n: usize = value.parse().map_err(|_| {
                        anyhow!("{}:{}: bad stdin value {value}", file.display(), lineno)
                    })?;
                    if n == 0 {
                        bail!("{}:{}: stdin argument numbers start at 1", file.display(), lineno);
                    }
                    StdinArg::Index(n)
                });
            }
            "user" => {
                let user = User::from_name(value)
                    .with_context(|| {
                        format!("{}:{}: looking up user {value}", file.display(), lineno)
                    })?
                    .ok_or_else(|| {
                        anyhow!("{}:{}: unknown user {value}", file.display(), lineno)
                    })?;
                rule.user = Some(RunAsUser {
                    name: String::from(value),
                    uid: user.uid,
                    gid: user.gid,
                });
            }
            "summary" => rule.summary = Some(String::from(value)),
            "help" => rule.help = Some(String::from(value)),
            _ => bail!("{}:{}: unknown option {key}", file.display(), lineno),
        }
        rest = &rest[1..];
    }

    if rest.is_empty() {
        bail!("{}:{}: missing ACL", file.display(), lineno);
    }
    for token in rest {
        let acl = Acl::parse(token)
            .with_context(|| format!("{}:{}: bad ACL {token}", file.display(), lineno))?;
        rule.acls.push(acl);
    }
    Ok(rule)
}

/// Join backslash-continued lines, reporting each logical line under
/// the number of its first physical line.
fn logical_lines(text: &str) -> Vec<(usize, String)> {
    let mut lines = Vec::new();
    let mut iter = text.lines().enumerate();
    while let Some((i, first)) = iter.next() {
        let mut logical = String::from(first);
        while logical.ends_with('\\') {
            logical.pop();
            match iter.next() {
                Some((_, next)) => logical.push_str(next),
                None => break,
            }
        }
        lines.push((i + 1, logical));
    }
    lines
}

#[cfg(test)]
mod test {
    use std::io::Write as _;

    use super::*;

    fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = fs::File::create(&path).expect("creating config file");
        f.write_all(contents.as_bytes()).expect("writing config file");
        path
    }

    #[test]
    fn basic_rules() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let conf = write_file(
            dir.path(),
            "remctl.conf",
            "# test configuration\n\
             test foo /bin/echo ANYUSER\n\
             test ALL /bin/true princ:admin@EXAMPLE.ORG\n\
             other ALL /bin/true ANYUSER\n",
        );

        let config = Config::load(&conf)?;
        assert_eq!(config.rules.len(), 3);

        let rule = config.find_rule("test", "foo").expect("rule to match");
        assert_eq!(rule.program, PathBuf::from("/bin/echo"));

        // Wildcard fallback only applies after exact matches.
        let rule = config.find_rule("test", "bar").expect("wildcard to match");
        assert_eq!(rule.subcommand, "ALL");

        assert!(config.find_rule("ghost", "x").is_none());
        Ok(())
    }

    #[test]
    fn options() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let conf = write_file(
            dir.path(),
            "remctl.conf",
            "test pw /bin/passwd logmask=2,3 stdin=last summary=list help=describe ANYUSER\n\
             test cat /bin/cat stdin=1 ANYUSER\n\
             test run /bin/true user=root ANYUSER\n",
        );

        let config = Config::load(&conf)?;
        let rule = config.find_rule("test", "pw").expect("rule to match");
        assert_eq!(rule.logmask, vec![2, 3]);
        assert_eq!(rule.stdin_arg, Some(StdinArg::Last));
        assert_eq!(rule.summary.as_deref(), Some("list"));
        assert_eq!(rule.help.as_deref(), Some("describe"));

        let rule = config.find_rule("test", "cat").expect("rule to match");
        assert_eq!(rule.stdin_arg, Some(StdinArg::Index(1)));

        let rule = config.find_rule("test", "run").expect("rule to match");
        let user = rule.user.as_ref().expect("user option");
        assert_eq!(user.name, "root");
        assert!(user.uid.is_root());
        Ok(())
    }

    #[test]
    fn load_time_errors() {
        let dir = tempfile::tempdir().expect("tempdir");

        // Unknown options fail the load, not the eventual dispatch.
        let conf =
            write_file(dir.path(), "bad-option", "test foo /bin/echo nonsense=1 ANYUSER\n");
        assert!(Config::load(&conf).is_err());

        let conf = write_file(dir.path(), "no-acl", "test foo /bin/echo\n");
        assert!(Config::load(&conf).is_err());

        let conf = write_file(dir.path(), "only-options", "test foo /bin/echo stdin=last\n");
        assert!(Config::load(&conf).is_err());

        let conf = write_file(dir.path(), "bad-scheme", "test foo /bin/echo ldap:whatever\n");
        assert!(Config::load(&conf).is_err());

        let conf = write_file(dir.path(), "bad-user", "test foo /bin/echo user=nosuchuser999 ANYUSER\n");
        assert!(Config::load(&conf).is_err());

        let conf = write_file(dir.path(), "zero-stdin", "test foo /bin/echo stdin=0 ANYUSER\n");
        assert!(Config::load(&conf).is_err());
    }

    #[test]
    fn continuation_lines() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let conf = write_file(
            dir.path(),
            "remctl.conf",
            "test foo /bin/echo \\\n    princ:admin@EXAMPLE.ORG \\\n    princ:other@EXAMPLE.ORG\n",
        );

        let config = Config::load(&conf)?;
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rules[0].acls.len(), 2);
        assert_eq!(config.rules[0].lineno, 1);
        Ok(())
    }

    #[test]
    fn includes() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let extra = write_file(dir.path(), "extra", "more cmd /bin/true ANYUSER\n");
        let subdir = dir.path().join("conf.d");
        fs::create_dir(&subdir).expect("creating conf.d");
        write_file(&subdir, "one", "sub one /bin/true ANYUSER\n");
        write_file(&subdir, "skip.conf", "sub skipped /bin/true ANYUSER\n");
        let conf = write_file(
            dir.path(),
            "remctl.conf",
            &format!(
                "test foo /bin/echo ANYUSER\ninclude {}\ninclude {}\n",
                extra.display(),
                subdir.display()
            ),
        );

        let config = Config::load(&conf)?;
        assert!(config.find_rule("test", "foo").is_some());
        assert!(config.find_rule("more", "cmd").is_some());
        assert!(config.find_rule("sub", "one").is_some());
        // Entries with periods in their names are not included.
        assert!(config.find_rule("sub", "skipped").is_none());
        Ok(())
    }

    #[test]
    fn include_cycles_are_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("self");
        write_file(dir.path(), "self", &format!("include {}\n", path.display()));
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn help_rules_never_match_data_commands() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let conf = write_file(
            dir.path(),
            "remctl.conf",
            "help ALL /bin/echo ANYUSER\ntest help /bin/echo ANYUSER\n",
        );

        let config = Config::load(&conf)?;
        assert!(config.find_rule("help", "anything").is_none());
        assert!(config.find_rule("test", "help").is_none());
        Ok(())
    }

    #[test]
    fn logical_line_numbering() {
        let lines = logical_lines("a\nb \\\nc\nd\n");
        assert_eq!(
            lines,
            vec![
                (1, String::from("a")),
                (2, String::from("b c")),
                (4, String::from("d")),
            ]
        );
    }
}
