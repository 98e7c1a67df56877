use crate::error::{PaymentError, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

#[derive(Debug, Deserialize, PartialEq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Authorize,
    Sale,
    Capture,
    Void,
    Refund,
    Link,
    Return,
    Sweep,
}

impl CommandKind {
    /// The name used in the `op` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Authorize => "authorize",
            CommandKind::Sale => "sale",
            CommandKind::Capture => "capture",
            CommandKind::Void => "void",
            CommandKind::Refund => "refund",
            CommandKind::Link => "link",
            CommandKind::Return => "return",
            CommandKind::Sweep => "sweep",
        }
    }
}

/// One row of a batch file.
///
/// | op        | key | amount | currency | target                   | detail                  | owner |
/// |-----------|-----|--------|----------|--------------------------|-------------------------|-------|
/// | authorize | yes | yes    | yes      | card token or `method:<link key>` |                |       |
/// | sale      | yes | yes    | yes      | same as authorize        |                         |       |
/// | capture   | yes | yes    |          | key of the authorization |                         |       |
/// | void      | yes |        |          | key of the authorization |                         |       |
/// | refund    | yes | yes    |          | key of capture/sale      |                         |       |
/// | link      | yes |        | yes      | account reference        | `bank_account` / `card` | yes   |
/// | return    |     |        |          | key of the link          | return code             |       |
/// | sweep     |     |        |          |                          | optional RFC 3339 time  |       |
#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct Command {
    pub op: CommandKind,
    pub key: Option<String>,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub target: Option<String>,
    pub detail: Option<String>,
    pub owner: Option<String>,
}

/// Reads batch commands from a CSV source.
///
/// Wraps `csv::Reader`, trimming whitespace and tolerating short rows.
pub struct CommandReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> CommandReader<R> {
    /// Creates a new `CommandReader` from any `Read` source (e.g., File, Stdin).
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily reads and deserializes commands, one `Result` per row.
    pub fn commands(self) -> impl Iterator<Item = Result<Command>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(PaymentError::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const HEADER: &str = "op, key, amount, currency, target, detail, owner\n";

    #[test]
    fn test_reader_valid_stream() {
        let data = format!(
            "{}authorize, K1, 50.00, USD, tok_visa, , \ncapture, C1, 30, , K1, , \nsweep, , , , , , ",
            HEADER
        );
        let commands: Vec<Result<Command>> = CommandReader::new(data.as_bytes()).commands().collect();

        assert_eq!(commands.len(), 3);
        let authorize = commands[0].as_ref().unwrap();
        assert_eq!(authorize.op, CommandKind::Authorize);
        assert_eq!(authorize.amount, Some(dec!(50.00)));
        assert_eq!(authorize.target.as_deref(), Some("tok_visa"));
        assert_eq!(authorize.detail, None);

        let sweep = commands[2].as_ref().unwrap();
        assert_eq!(sweep.op, CommandKind::Sweep);
        assert_eq!(sweep.key, None);
    }

    #[test]
    fn test_reader_malformed_line() {
        let data = format!("{}explode, K1, 1.0, USD, tok, , \nvoid, V1, abc, , K1, , ", HEADER);
        let commands: Vec<Result<Command>> = CommandReader::new(data.as_bytes()).commands().collect();

        assert!(commands[0].is_err());
        assert!(commands[1].is_err());
    }
}
