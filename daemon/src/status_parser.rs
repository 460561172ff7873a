/// Parser for the OpenVPN server status file (`--status`).
///
/// Handles all three `--status-version` layouts:
///   - v1  `OpenVPN CLIENT LIST` / `ROUTING TABLE` / `GLOBAL STATS` sections.
///   - v2  tagged rows (`TITLE`, `TIME`, `HEADER`, `CLIENT_LIST`, ...) separated by commas.
///   - v3  the v2 layout separated by tabs.
///
/// Columns are located through the header rows rather than fixed positions, so
/// the extra columns newer OpenVPN releases append are tolerated.
use std::collections::HashMap;

use chrono::NaiveDateTime;
use thiserror::Error;

const TIMESTAMP_FORMATS: [&str; 2] = ["%a %b %d %H:%M:%S %Y", "%Y-%m-%d %H:%M:%S"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StatusParseError {
    #[error("status file is empty")]
    Empty,

    #[error("unrecognized status format (first line: {0:?})")]
    UnrecognizedFormat(String),

    #[error("status file ends before the END marker")]
    Truncated,

    #[error("line {line}: {reason}")]
    InvalidRow { line: usize, reason: String },
}

/// One row of the client list, before an identity key is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientEntry {
    pub common_name: String,
    pub real_address: String,
    pub virtual_address: Option<String>,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub connected_since: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedStatus {
    pub updated_at: Option<NaiveDateTime>,
    pub clients: Vec<ClientEntry>,
}

/// Parses the full text of a status file.
pub fn parse(text: &str) -> Result<ParsedStatus, StatusParseError> {
    let first = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or(StatusParseError::Empty)?;

    if first == "OpenVPN CLIENT LIST" {
        return parse_sections(text);
    }

    let delimiter = if first.contains('\t') { '\t' } else { ',' };
    let tag = first.split(delimiter).next().unwrap_or_default();
    match tag {
        "TITLE" | "TIME" | "HEADER" | "CLIENT_LIST" => parse_tagged(text, delimiter),
        _ => Err(StatusParseError::UnrecognizedFormat(first.to_string())),
    }
}

/// Parses an OpenVPN timestamp such as `Thu Jun  4 04:23:03 2015` or
/// `2015-06-04 04:23:03`.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let normalized = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&normalized, fmt).ok())
}

// ── Version 1 ─────────────────────────────────────────────────────────────────

#[derive(Clone, Copy)]
enum Section {
    Preamble,
    Clients,
    Routing,
    Stats,
}

fn parse_sections(text: &str) -> Result<ParsedStatus, StatusParseError> {
    let mut builder = StatusBuilder::default();
    let mut section = Section::Preamble;

    for (i, raw) in text.lines().enumerate() {
        let line_no = i + 1;
        let line = raw.trim();
        match line {
            "" => continue,
            "OpenVPN CLIENT LIST" => section = Section::Clients,
            "ROUTING TABLE" => section = Section::Routing,
            "GLOBAL STATS" => section = Section::Stats,
            "END" => return builder.finish(),
            _ => {
                let fields: Vec<&str> = line.split(',').collect();
                match section {
                    Section::Clients => {
                        if let Some(stamp) = line.strip_prefix("Updated,") {
                            builder.updated_at = Some(timestamp(stamp, line_no)?);
                        } else if fields.first() == Some(&"Common Name") {
                            builder.client_header(&fields);
                        } else {
                            builder.client_row(&fields, line_no)?;
                        }
                    }
                    Section::Routing => {
                        if fields.first() == Some(&"Virtual Address") {
                            builder.route_header(&fields);
                        } else {
                            builder.route_row(&fields, line_no)?;
                        }
                    }
                    Section::Preamble | Section::Stats => {}
                }
            }
        }
    }

    Err(StatusParseError::Truncated)
}

// ── Versions 2 and 3 ──────────────────────────────────────────────────────────

fn parse_tagged(text: &str, delimiter: char) -> Result<ParsedStatus, StatusParseError> {
    let mut builder = StatusBuilder::default();

    for (i, raw) in text.lines().enumerate() {
        let line_no = i + 1;
        let line = raw.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(delimiter).collect();
        match fields[0] {
            "TIME" => {
                let stamp = fields.get(1).copied().unwrap_or_default();
                builder.updated_at = Some(timestamp(stamp, line_no)?);
            }
            "HEADER" => match fields.get(1).copied() {
                Some("CLIENT_LIST") => builder.client_header(&fields[2..]),
                Some("ROUTING_TABLE") => builder.route_header(&fields[2..]),
                _ => {}
            },
            "CLIENT_LIST" => builder.client_row(&fields[1..], line_no)?,
            "ROUTING_TABLE" => builder.route_row(&fields[1..], line_no)?,
            "END" => return builder.finish(),
            // TITLE, GLOBAL_STATS and tags from newer releases carry nothing we track.
            _ => {}
        }
    }

    Err(StatusParseError::Truncated)
}

// ── Shared row handling ───────────────────────────────────────────────────────

struct ClientColumns {
    common_name: usize,
    real_address: usize,
    virtual_address: Option<usize>,
    bytes_received: usize,
    bytes_sent: usize,
    connected_since: usize,
}

impl ClientColumns {
    fn from_header(header: &[&str]) -> Option<Self> {
        Some(Self {
            common_name: column(header, "Common Name")?,
            real_address: column(header, "Real Address")?,
            virtual_address: column(header, "Virtual Address"),
            bytes_received: column(header, "Bytes Received")?,
            bytes_sent: column(header, "Bytes Sent")?,
            connected_since: column(header, "Connected Since")?,
        })
    }
}

struct RouteColumns {
    virtual_address: usize,
    real_address: usize,
}

impl RouteColumns {
    fn from_header(header: &[&str]) -> Option<Self> {
        Some(Self {
            virtual_address: column(header, "Virtual Address")?,
            real_address: column(header, "Real Address")?,
        })
    }
}

fn column(header: &[&str], name: &str) -> Option<usize> {
    header.iter().position(|h| h.trim() == name)
}

fn field<'a>(fields: &[&'a str], idx: usize, name: &str, line: usize) -> Result<&'a str, StatusParseError> {
    fields
        .get(idx)
        .map(|f| f.trim())
        .ok_or_else(|| StatusParseError::InvalidRow {
            line,
            reason: format!("missing {name} column"),
        })
}

fn counter(raw: &str, name: &str, line: usize) -> Result<u64, StatusParseError> {
    raw.parse().map_err(|_| StatusParseError::InvalidRow {
        line,
        reason: format!("{name} is not a number: {raw:?}"),
    })
}

fn timestamp(raw: &str, line: usize) -> Result<NaiveDateTime, StatusParseError> {
    parse_timestamp(raw).ok_or_else(|| StatusParseError::InvalidRow {
        line,
        reason: format!("unparseable timestamp {raw:?}"),
    })
}

#[derive(Default)]
struct StatusBuilder {
    updated_at: Option<NaiveDateTime>,
    clients: Vec<ClientEntry>,
    routes: HashMap<String, String>,
    client_columns: Option<ClientColumns>,
    route_columns: Option<RouteColumns>,
}

impl StatusBuilder {
    fn client_header(&mut self, header: &[&str]) {
        // Headers missing a required column leave the layout unknown; the next
        // client row then fails with a line-numbered error.
        self.client_columns = ClientColumns::from_header(header);
    }

    fn route_header(&mut self, header: &[&str]) {
        self.route_columns = RouteColumns::from_header(header);
    }

    fn client_row(&mut self, fields: &[&str], line: usize) -> Result<(), StatusParseError> {
        let cols = self
            .client_columns
            .as_ref()
            .ok_or_else(|| StatusParseError::InvalidRow {
                line,
                reason: "client row without a usable client list header".to_string(),
            })?;

        let virtual_address = match cols.virtual_address {
            Some(idx) => fields
                .get(idx)
                .map(|f| f.trim())
                .filter(|f| !f.is_empty())
                .map(str::to_string),
            None => None,
        };

        let entry = ClientEntry {
            common_name: field(fields, cols.common_name, "Common Name", line)?.to_string(),
            real_address: field(fields, cols.real_address, "Real Address", line)?.to_string(),
            virtual_address,
            bytes_received: counter(
                field(fields, cols.bytes_received, "Bytes Received", line)?,
                "Bytes Received",
                line,
            )?,
            bytes_sent: counter(
                field(fields, cols.bytes_sent, "Bytes Sent", line)?,
                "Bytes Sent",
                line,
            )?,
            connected_since: timestamp(
                field(fields, cols.connected_since, "Connected Since", line)?,
                line,
            )?,
        };
        self.clients.push(entry);
        Ok(())
    }

    fn route_row(&mut self, fields: &[&str], line: usize) -> Result<(), StatusParseError> {
        let Some(cols) = self.route_columns.as_ref() else {
            return Err(StatusParseError::InvalidRow {
                line,
                reason: "routing row without a usable routing table header".to_string(),
            });
        };
        let virtual_address = field(fields, cols.virtual_address, "Virtual Address", line)?;
        let real_address = field(fields, cols.real_address, "Real Address", line)?;
        self.routes
            .entry(real_address.to_string())
            .or_insert_with(|| virtual_address.to_string());
        Ok(())
    }

    fn finish(mut self) -> Result<ParsedStatus, StatusParseError> {
        for client in &mut self.clients {
            if client.virtual_address.is_none() {
                client.virtual_address = self.routes.get(&client.real_address).cloned();
            }
        }
        Ok(ParsedStatus {
            updated_at: self.updated_at,
            clients: self.clients,
        })
    }
}
