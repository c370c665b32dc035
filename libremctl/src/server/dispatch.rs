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

//! Command dispatch: resolve a request against the configuration,
//! check authorization, write the audit log, and hand the command to
//! the subprocess engine. Shared by the network server and the ssh
//! transport.

use tracing::{info, warn};

use crate::server::{
    acl,
    command::{self, CommandContext, PumpResult, ResponseSink},
    config::{Config, Rule},
};
use remctl_protocol::ErrorCode;

/// Handle one complete command. Authorization failures and unknown
/// commands are reported to the client and logged; only transport
/// failures propagate as errors.
pub fn dispatch(
    config: &Config,
    ctx: &CommandContext,
    argv: &[Vec<u8>],
    sink: &mut dyn ResponseSink,
) -> anyhow::Result<()> {
    let Ok(command) = std::str::from_utf8(&argv[0]) else {
        warn!("non-text command type from user {}", ctx.user);
        return sink.error(ErrorCode::UnknownCommand, ErrorCode::UnknownCommand.message());
    };
    if command == "help" {
        return help_command(config, ctx, argv, sink);
    }
    let subcommand = argv.get(1).and_then(|s| std::str::from_utf8(s).ok()).unwrap_or("");

    let rule = config.find_rule(command, subcommand);
    log_command(argv, rule, ctx.user);

    let Some(rule) = rule else {
        info!("unknown command {} {} from user {}", command, subcommand, ctx.user);
        return sink.error(ErrorCode::UnknownCommand, ErrorCode::UnknownCommand.message());
    };
    if !acl::permit(&rule.acls, ctx.user) {
        info!("access denied: user {}, command {} {}", ctx.user, command, subcommand);
        return sink.error(ErrorCode::Access, ErrorCode::Access.message());
    }

    command::run_command(rule, ctx, argv, sink)
}

/// The help meta-command.
///
/// With no arguments, runs every summary-enabled command the caller is
/// authorized for and merges the output into one response. With a type
/// and optional service, runs the matched rule's program with its
/// configured help argument.
fn help_command(
    config: &Config,
    ctx: &CommandContext,
    argv: &[Vec<u8>],
    sink: &mut dyn ResponseSink,
) -> anyhow::Result<()> {
    log_command(argv, None, ctx.user);
    match argv.len() {
        1 => summary(config, ctx, sink),
        2 | 3 => {
            let command = argv.get(1).and_then(|s| std::str::from_utf8(s).ok()).unwrap_or("");
            let subcommand =
                argv.get(2).and_then(|s| std::str::from_utf8(s).ok()).unwrap_or("");

            let Some(rule) = config.find_rule(command, subcommand) else {
                info!("help for unknown command {} from user {}", command, ctx.user);
                return sink
                    .error(ErrorCode::UnknownCommand, ErrorCode::UnknownCommand.message());
            };
            if !acl::permit(&rule.acls, ctx.user) {
                info!("access denied: user {}, help {} {}", ctx.user, command, subcommand);
                return sink.error(ErrorCode::Access, ErrorCode::Access.message());
            }
            let Some(help_arg) = &rule.help else {
                return sink.error(ErrorCode::NoHelp, ErrorCode::NoHelp.message());
            };

            let mut child_args: Vec<&[u8]> = vec![help_arg.as_bytes()];
            if argv.len() == 3 {
                child_args.push(&argv[2]);
            }
            finish(command::spawn_and_pump(rule, ctx, argv, &child_args, None, sink)?, sink)
        }
        _ => sink.error(ErrorCode::BadCommand, ErrorCode::BadCommand.message()),
    }
}

fn summary(
    config: &Config,
    ctx: &CommandContext,
    sink: &mut dyn ResponseSink,
) -> anyhow::Result<()> {
    let mut ran_any = false;
    for rule in config.summary_rules() {
        if !acl::permit(&rule.acls, ctx.user) {
            continue;
        }
        let Some(summary_arg) = &rule.summary else {
            continue;
        };
        let meta_argv = vec![rule.command.clone().into_bytes()];
        let child_args: Vec<&[u8]> = vec![summary_arg.as_bytes()];
        match command::spawn_and_pump(rule, ctx, &meta_argv, &child_args, None, sink)? {
            PumpResult::Exited(_) => ran_any = true,
            PumpResult::Signaled => {
                return sink.error(ErrorCode::Internal, "Internal failure");
            }
            PumpResult::Reported => return Ok(()),
        }
    }
    // A configuration with nothing to summarize for this caller means
    // the help command itself does not exist.
    if !ran_any {
        info!("no summary-enabled commands for user {}", ctx.user);
        return sink.error(ErrorCode::UnknownCommand, ErrorCode::UnknownCommand.message());
    }
    sink.status(0)
}

fn finish(result: PumpResult, sink: &mut dyn ResponseSink) -> anyhow::Result<()> {
    match result {
        PumpResult::Exited(code) => sink.status(code as u8),
        PumpResult::Signaled => sink.error(ErrorCode::Internal, "Internal failure"),
        PumpResult::Reported => Ok(()),
    }
}

/// Write the audit line for a command, masking the argument positions
/// the matched rule asks to hide.
fn log_command(argv: &[Vec<u8>], rule: Option<&Rule>, user: &str) {
    let rendered: Vec<String> = argv
        .iter()
        .enumerate()
        .map(|(i, arg)| {
            let masked = rule.map(|r| r.logmask.contains(&i)).unwrap_or(false);
            if masked {
                String::from("**MASKED**")
            } else {
                String::from_utf8_lossy(arg).into_owned()
            }
        })
        .collect();
    info!("command from {}: {}", user, rendered.join(" "));
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use ntest::timeout;

    use super::*;
    use crate::server::{acl::Acl, config::Rule};

    #[derive(Debug, PartialEq, Eq)]
    enum Event {
        Output(u8, Vec<u8>),
        Status(u8),
        Error(u32, String),
    }

    #[derive(Default)]
    struct TestSink {
        events: Vec<Event>,
    }

    impl ResponseSink for TestSink {
        fn output(&mut self, stream: u8, data: &[u8]) -> anyhow::Result<()> {
            self.events.push(Event::Output(stream, data.to_vec()));
            Ok(())
        }

        fn status(&mut self, status: u8) -> anyhow::Result<()> {
            self.events.push(Event::Status(status));
            Ok(())
        }

        fn error(&mut self, code: ErrorCode, message: &str) -> anyhow::Result<()> {
            self.events.push(Event::Error(code as u32, String::from(message)));
            Ok(())
        }
    }

    impl TestSink {
        fn stdout(&self) -> Vec<u8> {
            let mut out = Vec::new();
            for event in &self.events {
                if let Event::Output(1, data) = event {
                    out.extend_from_slice(data);
                }
            }
            out
        }
    }

    fn rule(command: &str, subcommand: &str, program: &str, acls: Vec<Acl>) -> Rule {
        Rule {
            command: String::from(command),
            subcommand: String::from(subcommand),
            program: PathBuf::from(program),
            logmask: Vec::new(),
            stdin_arg: None,
            user: None,
            summary: None,
            help: None,
            acls,
            file: PathBuf::from("test.conf"),
            lineno: 1,
        }
    }

    fn ctx() -> CommandContext<'static> {
        CommandContext {
            user: "tester@EXAMPLE.ORG",
            addr: None,
            hostname: None,
            expires: 0,
        }
    }

    fn args(argv: &[&str]) -> Vec<Vec<u8>> {
        argv.iter().map(|a| a.as_bytes().to_vec()).collect()
    }

    #[test]
    #[timeout(30000)]
    fn unknown_command() -> anyhow::Result<()> {
        let config = Config { rules: vec![rule("test", "foo", "/bin/echo", vec![Acl::AnyUser])] };
        let mut sink = TestSink::default();
        dispatch(&config, &ctx(), &args(&["ghost", "x"]), &mut sink)?;
        assert_eq!(
            sink.events,
            vec![Event::Error(
                ErrorCode::UnknownCommand as u32,
                String::from("Unknown command")
            )]
        );
        Ok(())
    }

    #[test]
    #[timeout(30000)]
    fn access_denied() -> anyhow::Result<()> {
        let config = Config {
            rules: vec![rule(
                "test",
                "foo",
                "/bin/echo",
                vec![Acl::File(PathBuf::from("/nonexistent/empty"))],
            )],
        };
        let mut sink = TestSink::default();
        dispatch(&config, &ctx(), &args(&["test", "foo", "x"]), &mut sink)?;
        assert_eq!(
            sink.events,
            vec![Event::Error(ErrorCode::Access as u32, String::from("Access denied"))]
        );
        Ok(())
    }

    #[test]
    #[timeout(30000)]
    fn permitted_command_runs() -> anyhow::Result<()> {
        let config = Config { rules: vec![rule("test", "foo", "/bin/echo", vec![Acl::AnyUser])] };
        let mut sink = TestSink::default();
        dispatch(&config, &ctx(), &args(&["test", "foo", "hello world"]), &mut sink)?;

        assert_eq!(sink.stdout(), b"hello world\n");
        assert_eq!(sink.events.last(), Some(&Event::Status(0)));
        Ok(())
    }

    #[test]
    #[timeout(30000)]
    fn help_without_help_option() -> anyhow::Result<()> {
        let config = Config { rules: vec![rule("test", "foo", "/bin/echo", vec![Acl::AnyUser])] };
        let mut sink = TestSink::default();
        dispatch(&config, &ctx(), &args(&["help", "test", "foo"]), &mut sink)?;
        assert_eq!(
            sink.events,
            vec![Event::Error(
                ErrorCode::NoHelp as u32,
                String::from(ErrorCode::NoHelp.message())
            )]
        );
        Ok(())
    }

    #[test]
    #[timeout(30000)]
    fn help_runs_the_help_argument() -> anyhow::Result<()> {
        let mut with_help = rule("test", "foo", "/bin/echo", vec![Acl::AnyUser]);
        with_help.help = Some(String::from("--describe"));
        let config = Config { rules: vec![with_help] };

        let mut sink = TestSink::default();
        dispatch(&config, &ctx(), &args(&["help", "test", "foo"]), &mut sink)?;
        assert_eq!(sink.stdout(), b"--describe foo\n");
        assert_eq!(sink.events.last(), Some(&Event::Status(0)));
        Ok(())
    }

    #[test]
    #[timeout(30000)]
    fn summary_merges_authorized_rules() -> anyhow::Result<()> {
        let mut first = rule("alpha", "ALL", "/bin/echo", vec![Acl::AnyUser]);
        first.summary = Some(String::from("alpha-summary"));
        let mut second = rule("beta", "ALL", "/bin/echo", vec![
            // Unauthorized rules are silently skipped.
            Acl::Principal(String::from("somebody-else@EXAMPLE.ORG")),
        ]);
        second.summary = Some(String::from("beta-summary"));
        let config = Config { rules: vec![first, second] };

        let mut sink = TestSink::default();
        dispatch(&config, &ctx(), &args(&["help"]), &mut sink)?;
        assert_eq!(sink.stdout(), b"alpha-summary\n");
        assert_eq!(sink.events.last(), Some(&Event::Status(0)));
        Ok(())
    }

    #[test]
    #[timeout(30000)]
    fn summary_without_summary_rules_is_unknown() -> anyhow::Result<()> {
        // No rule carries summary=, so a bare help has nothing to run.
        let config = Config { rules: vec![rule("test", "foo", "/bin/echo", vec![Acl::AnyUser])] };
        let mut sink = TestSink::default();
        dispatch(&config, &ctx(), &args(&["help"]), &mut sink)?;
        assert_eq!(
            sink.events,
            vec![Event::Error(
                ErrorCode::UnknownCommand as u32,
                String::from("Unknown command")
            )]
        );

        // The same applies when summary rules exist but the caller may
        // not run any of them.
        let mut unauthorized = rule(
            "alpha",
            "ALL",
            "/bin/echo",
            vec![Acl::Principal(String::from("somebody-else@EXAMPLE.ORG"))],
        );
        unauthorized.summary = Some(String::from("alpha-summary"));
        let config = Config { rules: vec![unauthorized] };
        let mut sink = TestSink::default();
        dispatch(&config, &ctx(), &args(&["help"]), &mut sink)?;
        assert_eq!(
            sink.events,
            vec![Event::Error(
                ErrorCode::UnknownCommand as u32,
                String::from("Unknown command")
            )]
        );
        Ok(())
    }
}
