use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn cli_relay_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("relay_chat");

    let (mut server_child, mut server_stdout) = spawn_server(&binary).await?;
    let port = read_server_port(&mut server_stdout).await?;

    let mut alice = spawn_client(&binary, "alice", port).await?;
    alice.sync("alice joined").await?;
    let mut bob = spawn_client(&binary, "bob", port).await?;
    bob.sync("bob joined").await?;
    let alice_sees_bob = read_line_expect(&mut alice.stdout, "alice sees bob join").await?;
    assert_eq!(alice_sees_bob, "bob joined");

    // Payloads are printed without the framing marker, sender included.
    alice.send_line("Hello from Alice").await?;
    assert_eq!(
        read_line_expect(&mut alice.stdout, "alice echo").await?,
        "Hello from Alice"
    );
    assert_eq!(
        read_line_expect(&mut bob.stdout, "bob hears alice").await?,
        "Hello from Alice"
    );

    bob.send_line("Hi Alice!").await?;
    assert_eq!(
        read_line_expect(&mut alice.stdout, "alice hears bob").await?,
        "Hi Alice!"
    );
    assert_eq!(read_line_expect(&mut bob.stdout, "bob echo").await?, "Hi Alice!");

    // Closing stdin ends a client cleanly.
    drop(alice.stdin);
    ensure_success(&mut alice.child, "alice client").await?;

    // Killing the server ends the remaining client with a notice.
    let _ = server_child.kill().await;
    let _ = server_child.wait().await;
    assert_eq!(
        read_line_expect(&mut bob.stdout, "bob sees server go away").await?,
        "*** server closed the connection"
    );
    ensure_success(&mut bob.child, "bob client").await?;

    Ok(())
}

#[tokio::test]
async fn server_exits_non_zero_when_port_is_taken() -> Result<()> {
    let taken = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = taken.local_addr()?;

    let output = Command::new(assert_cmd::cargo::cargo_bin!("relay_chat"))
        .arg("server")
        .arg("--listen")
        .arg(addr.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await?;

    assert!(!output.status.success());
    Ok(())
}

struct ClientProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ClientProcess {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to send line '{line}'"))?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Sends a line and waits for its echo, proving the client is registered.
    async fn sync(&mut self, line: &str) -> Result<()> {
        self.send_line(line).await?;
        let echo = read_line_expect(&mut self.stdout, "waiting for own echo").await?;
        if echo != line {
            return Err(anyhow!("expected echo '{line}', got '{echo}'"));
        }
        Ok(())
    }
}

async fn spawn_server(binary: &Path) -> Result<(Child, BufReader<ChildStdout>)> {
    let mut cmd = Command::new(binary);
    cmd.arg("server")
        .arg("--listen")
        .arg("127.0.0.1:0")
        .env("RUST_LOG_STYLE", "never")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd.spawn().context("failed to spawn server")?;
    let stdout = child
        .stdout
        .take()
        .context("server stdout missing after spawn")?;

    Ok((child, BufReader::new(stdout)))
}

async fn read_server_port(reader: &mut BufReader<ChildStdout>) -> Result<u16> {
    let line = read_line(reader)
        .await?
        .context("server did not emit listening address")?;
    let addr = line
        .split_whitespace()
        .last()
        .context("unexpected server banner format")?;
    let port = addr
        .rsplit(':')
        .next()
        .context("server banner missing port")?;
    port.parse()
        .with_context(|| format!("invalid port in banner: {line}"))
}

async fn spawn_client(binary: &Path, name: &str, port: u16) -> Result<ClientProcess> {
    let mut cmd = Command::new(binary);
    cmd.arg("client")
        .arg("--name")
        .arg(name)
        .arg("--port")
        .arg(port.to_string())
        .env("RUST_LOG", "warn")
        .env("RUST_LOG_STYLE", "never")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn client {name}"))?;

    let stdin = child
        .stdin
        .take()
        .context("client stdin missing after spawn")?;
    let stdout = child
        .stdout
        .take()
        .context("client stdout missing after spawn")?;

    Ok(ClientProcess {
        child,
        stdin,
        stdout: BufReader::new(stdout),
    })
}

async fn read_line_expect(
    reader: &mut BufReader<ChildStdout>,
    description: &str,
) -> Result<String> {
    match read_line(reader).await {
        Ok(Some(line)) => Ok(line),
        Ok(None) => Err(anyhow!("{description}: stream closed")),
        Err(err) => Err(err.context(format!("{description}: failed to read line"))),
    }
}

async fn read_line(reader: &mut BufReader<ChildStdout>) -> Result<Option<String>> {
    let mut line = String::new();
    let bytes = match timeout(READ_TIMEOUT, reader.read_line(&mut line)).await {
        Ok(result) => result?,
        Err(_) => return Err(anyhow!("timed out waiting for line")),
    };
    if bytes == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn ensure_success(child: &mut Child, name: &str) -> Result<()> {
    let status = timeout(READ_TIMEOUT, child.wait())
        .await
        .with_context(|| format!("{name} did not exit"))?
        .with_context(|| format!("failed to await {name} process"))?;
    if !status.success() {
        return Err(anyhow!("{name} exited with status {status}"));
    }
    Ok(())
}
