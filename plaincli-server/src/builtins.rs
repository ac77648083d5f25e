//! Commands served by the stock `plaincli` binary.

use crate::dispatch::{CommandIo, DispatchError, Dispatcher, Invocation};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::io::AsyncReadExt;

const COMMANDS: &[(&str, &str)] = &[
    ("help", "List available commands"),
    ("version", "Print the server version"),
    ("echo", "Print the arguments separated by spaces"),
    ("cat", "Copy stdin to stdout"),
    ("exit", "Exit with the given status"),
];

/// Built-in command set.
#[derive(Debug, Clone, Copy, Default)]
pub struct Builtins;

impl Builtins {
    async fn help(io: &mut CommandIo) -> Result<i32, DispatchError> {
        io.stdout.write_line("Available commands:").await?;
        for (name, summary) in COMMANDS {
            io.stdout
                .write_line(&format!("  {:<10} {}", name, summary))
                .await?;
        }
        Ok(0)
    }

    async fn cat(io: &mut CommandIo) -> Result<i32, DispatchError> {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = io.stdin.read(&mut buf).await?;
            if n == 0 {
                return Ok(0);
            }
            io.stdout.write_all(&buf[..n]).await?;
        }
    }

    fn parse_exit(args: &[String]) -> Result<i32, DispatchError> {
        match args {
            [code] => code
                .parse()
                .map_err(|_| DispatchError::Usage(format!("exit: invalid status '{}'", code))),
            _ => Err(DispatchError::Usage("usage: exit <status>".to_string())),
        }
    }
}

impl Dispatcher for Builtins {
    fn dispatch<'a>(
        &'a self,
        invocation: Invocation,
        io: &'a mut CommandIo,
    ) -> BoxFuture<'a, Result<i32, DispatchError>> {
        async move {
            match invocation.command.as_str() {
                "help" => Self::help(io).await,
                "version" => {
                    io.stdout
                        .write_line(&format!("plaincli {}", env!("CARGO_PKG_VERSION")))
                        .await?;
                    Ok(0)
                }
                "echo" => {
                    io.stdout.write_line(&invocation.args.join(" ")).await?;
                    Ok(0)
                }
                "cat" => Self::cat(io).await,
                "exit" => Self::parse_exit(&invocation.args),
                _ => Err(DispatchError::NoSuchCommand(invocation.command)),
            }
        }
        .boxed()
    }
}
