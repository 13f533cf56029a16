use super::reply::RespValue;
use crate::network::Client;
use bytes::Bytes;

/// Executes parsed commands for a client.
///
/// Called on the reactor thread with the full argument vector of one request.
/// Replies go through [`Client::add_reply`] and friends; the pipeline takes
/// care of queueing the client for writing.
pub trait CommandHandler<S>: Send {
    fn process_command(&mut self, client: &mut Client<S>, argv: Vec<Bytes>);
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Ping(Option<Bytes>),
    Echo(Bytes),
    Quit,
}

fn parse_command(mut argv: Vec<Bytes>) -> Result<Command, String> {
    if argv.is_empty() {
        return Err("empty command".to_string());
    }
    let name = argv.remove(0);
    let name_upper = name.to_ascii_uppercase();

    match &name_upper[..] {
        b"PING" => match argv.len() {
            0 => Ok(Command::Ping(None)),
            1 => Ok(Command::Ping(argv.pop())),
            _ => Err(wrong_arity("ping")),
        },
        b"ECHO" => match argv.pop() {
            Some(msg) if argv.is_empty() => Ok(Command::Echo(msg)),
            _ => Err(wrong_arity("echo")),
        },
        b"QUIT" => Ok(Command::Quit),
        _ => Err(format!(
            "unknown command '{}'",
            String::from_utf8_lossy(&name)
        )),
    }
}

fn wrong_arity(name: &str) -> String {
    format!("wrong number of arguments for '{}' command", name)
}

/// Connection-level commands: `PING [msg]`, `ECHO msg` and `QUIT`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicCommands;

impl<S> CommandHandler<S> for BasicCommands {
    fn process_command(&mut self, client: &mut Client<S>, argv: Vec<Bytes>) {
        let reply = match parse_command(argv) {
            Ok(Command::Ping(None)) => RespValue::simple("PONG"),
            Ok(Command::Ping(Some(msg))) | Ok(Command::Echo(msg)) => RespValue::bulk(msg),
            Ok(Command::Quit) => {
                client.add_reply_value(&RespValue::simple("OK"));
                client.close_after_reply();
                return;
            }
            Err(msg) => RespValue::error(format!("ERR {}", msg)),
        };
        client.add_reply_value(&reply);
    }
}
