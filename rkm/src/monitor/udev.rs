//! Arrival notifications from `udevadm monitor`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use futures::{StreamExt, future, stream};
use tokio::process::Command;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, warn};

use super::{EventSource, EventStream, MonitorError, RawVolumeEvent, lsblk};

pub struct UdevSource {
    udevadm: PathBuf,
    /// Report attached volumes first when set.
    lsblk: Option<PathBuf>,
}

impl UdevSource {
    pub fn new(udevadm: impl Into<PathBuf>) -> Self {
        Self {
            udevadm: udevadm.into(),
            lsblk: None,
        }
    }

    pub fn with_initial_scan(mut self, lsblk: impl Into<PathBuf>) -> Self {
        self.lsblk = Some(lsblk.into());
        self
    }
}

impl EventSource for UdevSource {
    fn subscribe(&self) -> Result<EventStream, MonitorError> {
        // Listen before scanning so nothing attached in between is missed.
        let mut child = Command::new(&self.udevadm)
            .args(["monitor", "--udev", "--property", "--subsystem-match=block"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| MonitorError::Spawn {
                program: self.udevadm.clone(),
                source,
            })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MonitorError::NoStdout(self.udevadm.clone()))?;

        // The child lives as long as the stream and is killed with it.
        let arrivals = FramedRead::new(stdout, LinesCodec::new())
            .take_while(|line| {
                if let Err(e) = line {
                    warn!("udevadm output unreadable: {e}");
                }
                future::ready(line.is_ok())
            })
            .scan((UeventParser::default(), child), |(parser, _child), line| {
                future::ready(Some(line.ok().and_then(|line| parser.push(&line))))
            })
            .filter_map(future::ready);

        let existing = match self.lsblk.clone() {
            Some(lsblk) => stream::once(async move {
                match lsblk::scan(&lsblk).await {
                    Ok(events) => {
                        debug!("initial scan found {} block devices", events.len());
                        events
                    }
                    Err(e) => {
                        warn!("initial volume scan failed: {e}");
                        Vec::new()
                    }
                }
            })
            .flat_map(stream::iter)
            .boxed(),
            None => stream::empty().boxed(),
        };

        Ok(existing.chain(arrivals).boxed())
    }
}

/// Assembles the blank-line separated property blocks printed by
/// `udevadm monitor --property`.
#[derive(Debug, Default)]
pub struct UeventParser {
    properties: HashMap<String, String>,
}

impl UeventParser {
    /// Feed one line. Returns an event when the line completes an arrival block.
    pub fn push(&mut self, line: &str) -> Option<RawVolumeEvent> {
        let line = line.trim_end();
        if line.is_empty() {
            let properties = std::mem::take(&mut self.properties);
            return arrival(properties);
        }
        // block headers such as "UDEV  [1234.56] add  /devices/... (block)"
        match line.split_once('=') {
            Some((key, value)) if !key.contains(char::is_whitespace) => {
                self.properties.insert(key.to_string(), value.to_string());
            }
            _ => {}
        }
        None
    }
}

fn arrival(mut properties: HashMap<String, String>) -> Option<RawVolumeEvent> {
    let accepted = match properties.get("ACTION").map(String::as_str) {
        Some("add") => true,
        Some("change") => properties.get("DISK_MEDIA_CHANGE").map(String::as_str) == Some("1"),
        _ => false,
    };
    if !accepted {
        return None;
    }

    let media_name = properties
        .remove("ID_FS_LABEL_ENC")
        .map(|label| decode_label(&label))
        .or_else(|| properties.remove("ID_FS_LABEL"));

    Some(RawVolumeEvent {
        media_name,
        content_type: properties.remove("ID_FS_TYPE"),
        media_uuid: properties.remove("ID_FS_UUID"),
        device_node: properties.remove("DEVNAME"),
    })
}

/// Undo udev's `\xNN` escaping of labels.
fn decode_label(encoded: &str) -> String {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escaped = match &bytes[i..] {
            [b'\\', b'x', ..] => bytes
                .get(i + 2..i + 4)
                .and_then(|hex| std::str::from_utf8(hex).ok())
                .and_then(|hex| u8::from_str_radix(hex, 16).ok()),
            _ => None,
        };
        if let Some(byte) = escaped {
            out.push(byte);
            i += 4;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
