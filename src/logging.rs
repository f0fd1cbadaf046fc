//! JSON line-delimited logging.
//!
//! Each call writes one JSON object per line to the sink. Configuration
//! logging iterates the serialized struct's named fields; hyperparameter
//! names are never resolved dynamically.

use std::io::{self, Write};
use std::sync::Mutex;

use serde::Serialize;
use serde_json::{json, Value};

/// Line-oriented JSON event logger.
pub struct JsonLogger {
    sink: Mutex<Box<dyn Write + Send>>,
}

impl JsonLogger {
    pub fn stderr() -> Self {
        Self::to_writer(Box::new(io::stderr()))
    }

    pub fn to_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            sink: Mutex::new(writer),
        }
    }

    /// Writes one event line; IO failures are swallowed, logging is
    /// best-effort and never aborts a rebuild.
    pub fn log_event(&self, event: &str, fields: Value) {
        let line = json!({ "event": event, "fields": fields });
        if let Ok(mut sink) = self.sink.lock() {
            let _ = writeln!(sink, "{}", line);
        }
    }

    /// Logs every named field of a serializable configuration section.
    pub fn log_config<T: Serialize>(&self, section: &str, config: &T) {
        let Ok(value) = serde_json::to_value(config) else {
            return;
        };
        match value {
            Value::Object(map) => {
                for (field, field_value) in map {
                    self.log_event(
                        "config",
                        json!({ "section": section, "name": field, "value": field_value }),
                    );
                }
            }
            other => self.log_event("config", json!({ "section": section, "value": other })),
        }
    }
}
