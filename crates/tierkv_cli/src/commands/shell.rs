//! Executes shell commands against a transaction client.

use super::{parse, Command, Line};
use crate::error::CliResult;
use std::io::Write;
use tierkv_client::TxnClient;
use tierkv_protocol::TxnResponse;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::debug;

/// What the shell does after a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Read the next line.
    Continue,
    /// Stop with this exit code.
    Exit(u8),
}

/// A command loop bound to one client.
pub struct Shell {
    client: TxnClient,
    json: bool,
}

impl Shell {
    /// Creates a shell. With `json` set every response is printed as JSON.
    pub fn new(client: TxnClient, json: bool) -> Self {
        Self { client, json }
    }

    /// Reads lines from `input` until it ends or a line stops the shell.
    /// Returns the exit code.
    pub async fn run<R, W>(&mut self, input: R, out: &mut W, prompt: Option<&str>) -> CliResult<u8>
    where
        R: AsyncBufRead + Unpin,
        W: Write,
    {
        let mut lines = input.lines();
        loop {
            if let Some(prompt) = prompt {
                write!(out, "{prompt}")?;
                out.flush()?;
            }
            let Some(line) = lines.next_line().await? else {
                return Ok(0);
            };
            if let Flow::Exit(code) = self.execute(&line, out).await? {
                return Ok(code);
            }
        }
    }

    /// Executes one line and writes its outcome to `out`.
    pub async fn execute<W: Write>(&mut self, line: &str, out: &mut W) -> CliResult<Flow> {
        let command = match parse(line) {
            Ok(Line::Command(command)) => command,
            Ok(Line::Exit) => return Ok(Flow::Exit(0)),
            Ok(Line::Unknown(word)) => {
                writeln!(out, "Unknown command: {word}")?;
                return Ok(Flow::Continue);
            }
            Err(usage) => {
                writeln!(out, "Usage: {usage}")?;
                return Ok(Flow::Exit(1));
            }
        };

        let request_id = match &command {
            Command::StartTxn { client_id } => self.client.start_txn(client_id)?,
            Command::Get { txn_id, key } => self.client.txn_get(txn_id, key)?,
            Command::Put { txn_id, key, value } => self.client.txn_put(txn_id, key, value)?,
            Command::Commit { txn_id } => self.client.commit_txn(txn_id)?,
        };
        debug!(request_id = %request_id, "issued");

        let response = self.client.wait_for(&request_id).await?;
        self.report(&command, &request_id, &response, out)?;
        Ok(Flow::Continue)
    }

    fn report<W: Write>(
        &self,
        command: &Command,
        request_id: &str,
        response: &TxnResponse,
        out: &mut W,
    ) -> CliResult<()> {
        if self.json {
            writeln!(out, "{}", serde_json::to_string(response)?)?;
            return Ok(());
        }

        if response.response_id != request_id {
            writeln!(out, "Invalid response: ID did not match request ID!")?;
        }
        let error = response.first_error();
        if !error.is_ok() {
            writeln!(out, "Failure: {error}")?;
            return Ok(());
        }
        match command {
            Command::StartTxn { .. } => writeln!(out, "Success! {}", response.txn_id)?,
            Command::Get { .. } => {
                let value = response.tuples.first().map_or("", |t| t.payload.as_str());
                writeln!(out, "Success! {value}")?;
            }
            Command::Put { .. } | Command::Commit { .. } => writeln!(out, "Success!")?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tierkv_client::ClientConfig;
    use tierkv_core::ClusterConfig;
    use tierkv_server::LocalCluster;

    fn shell(cluster: &LocalCluster, json: bool) -> Shell {
        let config = ClientConfig::new("127.0.0.1", 0)
            .with_routing(cluster.routing_addresses())
            .with_timeout(Duration::from_secs(5));
        Shell::new(TxnClient::connect(&cluster.network(), config), json)
    }

    async fn line(shell: &mut Shell, input: &str) -> String {
        let mut out = Vec::new();
        assert_eq!(shell.execute(input, &mut out).await.unwrap(), Flow::Continue);
        String::from_utf8(out).unwrap()
    }

    fn txn_id(output: &str) -> String {
        output
            .trim()
            .strip_prefix("Success! ")
            .expect("START_TXN succeeded")
            .to_string()
    }

    #[tokio::test]
    async fn write_commit_and_read_back() {
        let cluster = LocalCluster::start(ClusterConfig::default()).unwrap();
        let mut shell = shell(&cluster, false);

        let writer = txn_id(&line(&mut shell, "START_TXN alice").await);
        assert!(writer.starts_with("alice-"));
        assert_eq!(line(&mut shell, &format!("TXN_PUT {writer} k v")).await, "Success!\n");
        assert_eq!(line(&mut shell, &format!("COMMIT_TXN {writer}")).await, "Success!\n");

        let reader = txn_id(&line(&mut shell, "START_TXN alice").await);
        assert_eq!(
            line(&mut shell, &format!("TXN_GET {reader} k")).await,
            "Success! v\n"
        );
        assert_eq!(
            line(&mut shell, &format!("TXN_GET {reader} missing")).await,
            "Failure: KEY_DNE\n"
        );
    }

    #[tokio::test]
    async fn batch_stops_at_blank_line() {
        let cluster = LocalCluster::start(ClusterConfig::default()).unwrap();
        let mut shell = shell(&cluster, false);
        let input = "START_TXN alice\nCOMMIT_TXN alice-7:1\nBOGUS\n\nSTART_TXN never\n";

        let mut out = Vec::new();
        let code = shell.run(input.as_bytes(), &mut out, None).await.unwrap();
        let out = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = out.lines().collect();

        assert_eq!(code, 0);
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Success! alice-"));
        assert_eq!(lines[1], "Failure: TXN_DNE");
        assert_eq!(lines[2], "Unknown command: BOGUS");
    }

    #[tokio::test]
    async fn wrong_argument_count_exits_with_one() {
        let cluster = LocalCluster::start(ClusterConfig::default()).unwrap();
        let mut shell = shell(&cluster, false);

        let mut out = Vec::new();
        let code = shell
            .run("TXN_GET only-one\nSTART_TXN alice\n".as_bytes(), &mut out, None)
            .await
            .unwrap();

        assert_eq!(code, 1);
        let out = String::from_utf8(out).unwrap();
        assert_eq!(out, "Usage: TXN_GET expects 2 argument(s), got 1\n");
        assert_eq!(shell.client.outstanding(), 0);
    }

    #[tokio::test]
    async fn end_of_input_exits_cleanly() {
        let cluster = LocalCluster::start(ClusterConfig::default()).unwrap();
        let mut shell = shell(&cluster, false);

        let mut out = Vec::new();
        let code = shell.run(&b""[..], &mut out, Some("tierkv> ")).await.unwrap();
        assert_eq!(code, 0);
        assert_eq!(out, b"tierkv> ");
    }

    #[tokio::test]
    async fn json_output() {
        let cluster = LocalCluster::start(ClusterConfig::default()).unwrap();
        let mut shell = shell(&cluster, true);

        let out = line(&mut shell, "START_TXN alice").await;
        let value: serde_json::Value = serde_json::from_str(out.trim()).unwrap();
        assert_eq!(value["error"], "NO_ERROR");
        assert_eq!(value["request_type"], "START_TXN");
        assert!(value["txn_id"].as_str().unwrap().starts_with("alice-"));
    }
}
