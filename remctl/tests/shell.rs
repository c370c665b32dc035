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

//! End-to-end tests for the ssh transport. remctl-shell shares the
//! configuration, ACL, and subprocess machinery with remctld but needs
//! no Kerberos infrastructure, which makes it the natural place to
//! exercise the whole dispatch path for real.

use std::{
    fs,
    io::Write as _,
    path::{Path, PathBuf},
    process::{Command, Output, Stdio},
};

use anyhow::Context;
use ntest::timeout;

const TEST_USER: &str = "tester@EXAMPLE.ORG";

fn shell_bin() -> &'static str {
    env!("CARGO_BIN_EXE_remctl-shell")
}

fn write_config(dir: &Path, contents: &str) -> PathBuf {
    let path = dir.join("remctl.conf");
    let mut f = fs::File::create(&path).expect("creating config");
    f.write_all(contents.as_bytes()).expect("writing config");
    path
}

fn run_shell(config: &Path, command: &str) -> anyhow::Result<Output> {
    Command::new(shell_bin())
        .arg("-f")
        .arg(config)
        .env("REMCTL_USER", TEST_USER)
        .env("SSH_ORIGINAL_COMMAND", command)
        .env("SSH_CLIENT", "127.0.0.1 40000 22")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .context("running remctl-shell")
}

#[test]
#[timeout(30000)]
fn hello() -> anyhow::Result<()> {
    let tmp_dir = tempfile::Builder::new()
        .prefix("remctl-test")
        .tempdir()
        .context("creating tmp dir")?;
    let config = write_config(tmp_dir.path(), "test foo /bin/echo ANYUSER\n");

    let out = run_shell(&config, "test foo 'hello world'")?;
    assert_eq!(out.stdout, b"hello world\n");
    assert_eq!(out.status.code(), Some(0));
    Ok(())
}

#[test]
#[timeout(30000)]
fn access_denied() -> anyhow::Result<()> {
    let tmp_dir = tempfile::Builder::new()
        .prefix("remctl-test")
        .tempdir()
        .context("creating tmp dir")?;
    let empty_acl = tmp_dir.path().join("empty");
    fs::write(&empty_acl, "# nobody\n")?;
    let config = write_config(
        tmp_dir.path(),
        &format!("test foo /bin/echo file:{}\n", empty_acl.display()),
    );

    let out = run_shell(&config, "test foo x")?;
    assert_eq!(out.status.code(), Some(255));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("Access denied"), "stderr: {stderr}");
    Ok(())
}

#[test]
#[timeout(30000)]
fn unknown_command() -> anyhow::Result<()> {
    let tmp_dir = tempfile::Builder::new()
        .prefix("remctl-test")
        .tempdir()
        .context("creating tmp dir")?;
    let config = write_config(tmp_dir.path(), "test foo /bin/echo ANYUSER\n");

    let out = run_shell(&config, "ghost x")?;
    assert_eq!(out.status.code(), Some(255));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("Unknown command"), "stderr: {stderr}");
    Ok(())
}

#[test]
#[timeout(30000)]
fn stdin_redirection() -> anyhow::Result<()> {
    let tmp_dir = tempfile::Builder::new()
        .prefix("remctl-test")
        .tempdir()
        .context("creating tmp dir")?;
    let config = write_config(tmp_dir.path(), "test echo /bin/cat stdin=last ANYUSER\n");

    let out = run_shell(&config, "test echo 'input bytes'")?;
    // cat sees the final argument on stdin instead of its argv.
    assert_eq!(out.stdout, b"input bytes");
    assert_eq!(out.status.code(), Some(0));
    Ok(())
}

#[test]
#[timeout(30000)]
fn exit_status_is_mirrored() -> anyhow::Result<()> {
    let tmp_dir = tempfile::Builder::new()
        .prefix("remctl-test")
        .tempdir()
        .context("creating tmp dir")?;
    let config = write_config(tmp_dir.path(), "test ALL /bin/sh ANYUSER\n");

    let out = run_shell(&config, "test run -c 'exit 3'")?;
    assert_eq!(out.status.code(), Some(3));
    Ok(())
}

#[test]
#[timeout(30000)]
fn stderr_is_kept_separate() -> anyhow::Result<()> {
    let tmp_dir = tempfile::Builder::new()
        .prefix("remctl-test")
        .tempdir()
        .context("creating tmp dir")?;
    let config = write_config(tmp_dir.path(), "test ALL /bin/sh ANYUSER\n");

    let out = run_shell(&config, "test run -c 'echo out; echo err >&2'")?;
    assert_eq!(out.stdout, b"out\n");
    assert_eq!(out.stderr, b"err\n");
    assert_eq!(out.status.code(), Some(0));
    Ok(())
}

#[test]
#[timeout(30000)]
fn remote_user_reaches_the_command() -> anyhow::Result<()> {
    let tmp_dir = tempfile::Builder::new()
        .prefix("remctl-test")
        .tempdir()
        .context("creating tmp dir")?;
    let config = write_config(tmp_dir.path(), "test ALL /bin/sh ANYUSER\n");

    let out = run_shell(&config, "test env -c 'echo $REMOTE_USER:$REMOTE_ADDR'")?;
    assert_eq!(out.stdout, b"tester@EXAMPLE.ORG:127.0.0.1\n");
    Ok(())
}

#[test]
#[timeout(30000)]
fn quiet_flag_suppresses_diagnostics() -> anyhow::Result<()> {
    let tmp_dir = tempfile::Builder::new()
        .prefix("remctl-test")
        .tempdir()
        .context("creating tmp dir")?;
    let config = write_config(tmp_dir.path(), "test foo /bin/echo ANYUSER\n");

    let out = Command::new(shell_bin())
        .arg("-q")
        .arg("-f")
        .arg(&config)
        .env("REMCTL_USER", TEST_USER)
        .env("SSH_ORIGINAL_COMMAND", "ghost x")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()?;
    assert_eq!(out.status.code(), Some(255));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(!stderr.contains("Unknown command"), "stderr: {stderr}");
    Ok(())
}

#[test]
#[timeout(30000)]
fn version_flags() -> anyhow::Result<()> {
    for bin in [
        env!("CARGO_BIN_EXE_remctl"),
        env!("CARGO_BIN_EXE_remctld"),
        env!("CARGO_BIN_EXE_remctl-shell"),
    ] {
        let out = Command::new(bin).arg("-v").output().context("running -v")?;
        assert_eq!(out.status.code(), Some(0));
        assert!(!out.stdout.is_empty());
    }
    Ok(())
}
