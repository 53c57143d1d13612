use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    protocol::{
        DEFAULT_MAX_LINE_BYTES, LineTooLong, discard_line, parse_relayed, read_line, write_line,
    },
};

pub async fn run(args: ClientArgs) -> Result<()> {
    let (reader, mut writer) = establish_connection(&args).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let name = match args.name.clone() {
        Some(name) => name,
        None => prompt_for_name(&mut stdin).await?,
    };
    write_line(&mut writer, &name)
        .await
        .context("failed to send display name")?;

    let mut relay = tokio::spawn(print_relayed(reader));

    let relay_finished = run_input_loop(&mut stdin, &mut writer, &mut relay).await?;
    shutdown_connection(&mut writer).await;

    if !relay_finished {
        relay.abort();
    }

    Ok(())
}

async fn prompt_for_name(stdin: &mut BufReader<tokio::io::Stdin>) -> Result<String> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(b"Enter your username: ").await?;
    stdout.flush().await?;

    let mut name = String::new();
    stdin.read_line(&mut name).await?;
    Ok(name.trim_end_matches(['\r', '\n']).to_string())
}

async fn establish_connection(args: &ClientArgs) -> Result<(OwnedReadHalf, OwnedWriteHalf)> {
    let address = format!("{}:{}", args.host, args.port);
    let stream = TcpStream::connect(&address)
        .await
        .with_context(|| format!("failed to connect to {address}"))?;

    info!("connected to {}", address);
    Ok(stream.into_split())
}

/// Forwards stdin lines to the server until stdin closes, Ctrl-C arrives,
/// or the relay task ends. Returns whether the relay task has finished.
async fn run_input_loop<W>(
    stdin: &mut BufReader<tokio::io::Stdin>,
    writer: &mut W,
    relay: &mut JoinHandle<()>,
) -> Result<bool>
where
    W: AsyncWrite + Unpin,
{
    let mut input = String::new();
    loop {
        input.clear();
        select! {
            bytes_read = stdin.read_line(&mut input) => {
                if !forward_input(bytes_read, &input, writer).await? {
                    return Ok(false);
                }
            }
            finished = &mut *relay => {
                if let Err(error) = finished {
                    warn!(?error, "relay task failed");
                }
                return Ok(true);
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                return Ok(false);
            }
        }
    }
}

async fn forward_input<W>(bytes_read: io::Result<usize>, input: &str, writer: &mut W) -> Result<bool>
where
    W: AsyncWrite + Unpin,
{
    if bytes_read? == 0 {
        return Ok(false);
    }

    let line = input.trim_end_matches(['\r', '\n']);
    write_line(writer, line)
        .await
        .context("failed to send line to server")?;
    Ok(true)
}

async fn print_relayed(reader: OwnedReadHalf) {
    let mut reader = BufReader::new(reader);
    if let Err(error) = relay_to_stdout(&mut reader, &mut tokio::io::stdout()).await {
        warn!(?error, "lost connection to server");
    }
    if let Err(error) = write_stdout("*** server closed the connection").await {
        debug!(?error, "failed to print disconnect notice");
    }
}

/// Copies relayed payloads from the server to `out`, skipping any line
/// without the framing marker. Returns once the server closes the stream.
async fn relay_to_stdout<R, W>(reader: &mut R, out: &mut W) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    relay_lines(reader, out, RELAYED_LINE_BYTES).await
}

// Servers may raise their own cap, so longer lines are skipped, not fatal.
const RELAYED_LINE_BYTES: usize = DEFAULT_MAX_LINE_BYTES * 2;

async fn relay_lines<R, W>(reader: &mut R, out: &mut W, max_bytes: usize) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let line = match read_line(reader, max_bytes).await {
            Ok(Some(line)) => line,
            Ok(None) => return Ok(()),
            Err(err) => match LineTooLong::from_io(&err) {
                Some(too_long) => {
                    warn!(max_bytes, "skipping over-long line from server");
                    if too_long.unterminated {
                        discard_line(reader).await?;
                    }
                    continue;
                }
                None => return Err(err),
            },
        };

        match parse_relayed(&line) {
            Some(payload) => write_line(out, payload).await?,
            None => debug!(line = %line, "ignoring unframed server line"),
        }
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    write_line(&mut tokio::io::stdout(), line).await
}
