// Standard library imports
use std::fmt::Write;
use std::str::FromStr;

/// Fields of an ErrorResponse or NoticeResponse.
/// See: https://www.postgresql.org/docs/current/protocol-error-fields.html
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ServerErrorMessage {
    pub severity_localized: String,      // S
    pub severity: String,                // V
    pub code: String,                    // C
    pub message: String,                 // M
    pub detail: Option<String>,          // D
    pub hint: Option<String>,            // H
    pub position: Option<u32>,           // P
    pub internal_position: Option<u32>,  // p
    pub internal_query: Option<String>,  // q
    pub where_context: Option<String>,   // W
    pub schema_name: Option<String>,     // s
    pub table_name: Option<String>,      // t
    pub column_name: Option<String>,     // c
    pub data_type_name: Option<String>,  // d
    pub constraint_name: Option<String>, // n
    pub file_name: Option<String>,       // F
    pub line: Option<u32>,               // L
    pub routine: Option<String>,         // R
}

impl ServerErrorMessage {
    /// Parse the already decoded body of an ErrorResponse / NoticeResponse:
    /// a sequence of `<field type byte><value>\0`, closed by a lone `\0`.
    pub fn parse(body: &str) -> ServerErrorMessage {
        let mut out = ServerErrorMessage::default();

        for field in body.split('\0') {
            let mut chars = field.chars();
            let field_type = match chars.next() {
                Some(c) => c,
                // Empty chunk: the terminator.
                None => continue,
            };
            let value = chars.as_str().to_string();

            match field_type {
                'S' => out.severity_localized = value,
                'V' => out.severity = value,
                'C' => out.code = value,
                'M' => out.message = value,
                'D' => out.detail = Some(value),
                'H' => out.hint = Some(value),
                'P' => out.position = Some(u32::from_str(&value).unwrap_or(0)),
                'p' => out.internal_position = Some(u32::from_str(&value).unwrap_or(0)),
                'q' => out.internal_query = Some(value),
                'W' => out.where_context = Some(value),
                's' => out.schema_name = Some(value),
                't' => out.table_name = Some(value),
                'c' => out.column_name = Some(value),
                'd' => out.data_type_name = Some(value),
                'n' => out.constraint_name = Some(value),
                'F' => out.file_name = Some(value),
                'L' => out.line = Some(u32::from_str(&value).unwrap_or(0)),
                'R' => out.routine = Some(value),
                _ => {}
            }
        }

        // Servers before 9.6 only send the localized severity.
        if out.severity.is_empty() {
            out.severity = out.severity_localized.clone();
        }

        out
    }

    /// Human readable form. `detail` and `hint` may carry row data and are
    /// only included when `log_detail` is set.
    pub fn render(&self, log_detail: bool) -> String {
        let severity = if self.severity_localized.is_empty() {
            &self.severity
        } else {
            &self.severity_localized
        };
        let mut out = format!("{}: {}", severity, self.message);

        if log_detail {
            if let Some(val) = &self.detail {
                let _ = write!(out, "\n  Detail: {val}");
            }
            if let Some(val) = &self.hint {
                let _ = write!(out, "\n  Hint: {val}");
            }
        }
        if let Some(val) = &self.position {
            let _ = write!(out, "\n  Position: {val}");
        }
        if let Some(val) = &self.where_context {
            let _ = write!(out, "\n  Where: {val}");
        }
        if log_detail {
            if let Some(val) = &self.internal_query {
                let _ = write!(out, "\n  Internal Query: {val}");
            }
            if let Some(val) = &self.internal_position {
                let _ = write!(out, "\n  Internal Position: {val}");
            }
        }
        if let Some(file) = &self.file_name {
            let _ = write!(out, "\n  Location: File: {file}");
            if let Some(routine) = &self.routine {
                let _ = write!(out, ", Routine: {routine}");
            }
            if let Some(line) = &self.line {
                let _ = write!(out, ", Line: {line}");
            }
        }
        if !self.code.is_empty() {
            let _ = write!(out, "\n  Server SQLState: {}", self.code);
        }

        out
    }
}

impl std::fmt::Display for ServerErrorMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.render(true))
    }
}
