//! Tail command implementation.

use crate::error::{CliError, CliResult};
use clap::ValueEnum;
use serde::Serialize;
use shapesync_client::{
    ReqwestTransport, ShapeDefinition, ShapeEvent, ShapeStream, ShapeStreamOptions,
};
use shapesync_protocol::Row;
use std::io::Write;
use tracing::info;

/// How events are printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// One human-readable line per event.
    Text,
    /// One JSON object per line.
    Json,
}

/// Arguments of the tail command.
#[derive(Debug, Clone)]
pub struct TailArgs {
    /// Shape endpoint.
    pub url: String,
    /// Table to follow.
    pub table: String,
    /// Row filter.
    pub where_clause: Option<String>,
    /// Column selection.
    pub columns: Option<Vec<String>>,
    /// Raw `name=value` query parameters.
    pub params: Vec<String>,
    /// Raw `name=value` headers.
    pub headers: Vec<String>,
    /// Keep long-polling once up to date.
    pub live: bool,
    /// Output format.
    pub format: OutputFormat,
}

impl TailArgs {
    /// Builds stream options. Validation of the result happens when the
    /// stream is created.
    pub fn into_options(self) -> CliResult<ShapeStreamOptions> {
        let mut definition = ShapeDefinition::new(self.table);
        if let Some(where_clause) = self.where_clause {
            definition = definition.with_where(where_clause);
        }
        if let Some(columns) = self.columns {
            definition = definition.with_columns(columns);
        }

        let mut options = ShapeStreamOptions::new(self.url, definition).with_live(self.live);
        for raw in &self.params {
            let (name, value) = parse_pair("param", raw)?;
            options = options.with_param(name, value);
        }
        for raw in &self.headers {
            let (name, value) = parse_pair("header", raw)?;
            options = options.with_header(name, value);
        }
        Ok(options)
    }
}

/// One output record.
#[derive(Debug, Serialize)]
pub struct EventLine {
    /// Event or operation name.
    pub event: String,
    /// Row key (operations only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Log position.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<String>,
    /// Row values (operations only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    /// Error message (errors only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EventLine {
    fn named(event: &str) -> Self {
        Self {
            event: event.to_string(),
            key: None,
            offset: None,
            value: None,
            error: None,
        }
    }
}

/// Runs the tail command until the stream stops, fails, or Ctrl-C.
pub async fn run(args: TailArgs) -> CliResult<()> {
    let format = args.format;
    let options = args.into_options()?;
    let transport = ReqwestTransport::new(options.request_timeout)?;
    let stream = ShapeStream::new(options, transport)?;
    let (_, mut events) = stream.subscribe_channel();

    stream.start()?;
    info!(
        table = %stream.options().definition.table,
        url = %stream.options().url,
        "following shape"
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;
    let mut failure = None;

    loop {
        tokio::select! {
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                info!("interrupted, stopping");
                stream.stop();
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                write_event(&mut std::io::stdout().lock(), &event, format)?;
                match event {
                    ShapeEvent::Stopped => break,
                    ShapeEvent::Error(err) => {
                        failure = Some(err);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    stream.join().await;
    match failure {
        Some(err) => Err(CliError::Stream((*err).clone())),
        None => Ok(()),
    }
}

/// Writes one event in the chosen format.
pub fn write_event(out: &mut impl Write, event: &ShapeEvent, format: OutputFormat) -> CliResult<()> {
    for line in event_lines(event) {
        match format {
            OutputFormat::Json => writeln!(out, "{}", serde_json::to_string(&line)?)?,
            OutputFormat::Text => writeln!(out, "{}", text_line(&line))?,
        }
    }
    out.flush()?;
    Ok(())
}

fn event_lines(event: &ShapeEvent) -> Vec<EventLine> {
    match event {
        ShapeEvent::Operations(operations) => operations
            .iter()
            .map(|op| EventLine {
                key: Some(op.key.clone()),
                offset: Some(op.offset.to_string()),
                value: Some(row_json(&op.value)),
                ..EventLine::named(op.kind.as_str())
            })
            .collect(),
        ShapeEvent::UpToDate { offset } => vec![EventLine {
            offset: Some(offset.to_string()),
            ..EventLine::named("up-to-date")
        }],
        ShapeEvent::Error(err) => vec![EventLine {
            error: Some(err.to_string()),
            ..EventLine::named("error")
        }],
        other => vec![EventLine::named(other.name())],
    }
}

fn text_line(line: &EventLine) -> String {
    let mut parts = vec![line.event.clone()];
    parts.extend(line.offset.clone());
    parts.extend(line.key.clone());
    parts.extend(line.value.as_ref().map(ToString::to_string));
    parts.extend(line.error.clone());
    parts.join(" ")
}

fn row_json(row: &Row) -> serde_json::Value {
    serde_json::Value::Object(
        row.iter()
            .map(|(column, value)| (column.clone(), value.to_json()))
            .collect(),
    )
}

fn parse_pair(kind: &'static str, raw: &str) -> CliResult<(String, String)> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(CliError::InvalidPair {
            kind,
            raw: raw.to_string(),
        }),
    }
}
