use futures::channel::mpsc;

use crate::{Status, esptool::Chip};

pub(crate) fn chan_send(chan: Option<&mut mpsc::Sender<Status>>, msg: Status) {
    if let Some(c) = chan {
        let _ = c.try_send(msg);
    }
}

/// Whole percentage from a write progress line.
///
/// esptool v4 prints `Writing at 0x00010000... (12 %)`, v5 prints
/// `Writing at 0x00010000 [==>   ] 14.3% 1024/8192 bytes...`.
pub(crate) fn parse_progress(line: &str) -> Option<u8> {
    let rest = line.trim().strip_prefix("Writing at ")?;

    let pct = match rest.rfind('(') {
        Some(start) => rest[start + 1..].trim_end_matches(')').trim(),
        None => rest.rsplit(']').next()?.split_whitespace().next()?,
    };
    let pct: f32 = pct.strip_suffix('%')?.trim().parse().ok()?;

    Some(pct.clamp(0.0, 100.0) as u8)
}

/// Value of a `Key: value` line. Newer esptool releases pad the key with spaces.
fn field<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let rest = line.trim().strip_prefix(key)?;
    let rest = rest.trim_start().strip_prefix(':').unwrap_or(rest);
    Some(rest.trim())
}

pub(crate) fn parse_chip<'a, I>(lines: I) -> Option<Chip>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut name = None;
    let mut mac = None;
    let mut features = Vec::new();

    for line in lines {
        let line = line.trim();

        if let Some(x) = line
            .strip_prefix("Chip is ")
            .or_else(|| field(line, "Chip type"))
        {
            let x = x.split(" (revision").next().unwrap_or(x).trim();
            name = Some(x.to_string());
        } else if let Some(x) = field(line, "Features") {
            features = x
                .split(',')
                .map(str::trim)
                .filter(|x| !x.is_empty())
                .map(String::from)
                .collect();
        } else if let Some(x) = field(line, "MAC") {
            if mac.is_none() {
                mac = Some(x.to_string());
            }
        }
    }

    Some(Chip {
        name: name?,
        mac: mac.unwrap_or_default(),
        features,
    })
}

/// The most useful line to show when esptool exits with an error.
pub(crate) fn failure_message<'a, I>(lines: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let lines: Vec<&str> = lines.into_iter().map(str::trim).collect();

    lines
        .iter()
        .rev()
        .find_map(|x| x.strip_prefix("A fatal error occurred:"))
        .map(|x| x.trim().to_string())
        .or_else(|| {
            lines
                .iter()
                .rev()
                .find(|x| !x.is_empty())
                .map(|x| x.to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHIP_ID_V4: &str = "esptool.py v4.7.0
Serial port /dev/ttyUSB0
Connecting....
Detecting chip type... ESP32
Chip is ESP32-D0WD-V3 (revision v3.0)
Features: WiFi, BT, Dual Core, 240MHz, VRef calibration in efuse, Coding Scheme None
Crystal is 40MHz
MAC: 24:0a:c4:00:01:02
Uploading stub...
Running stub...
Stub running...
MAC: 24:0a:c4:00:01:02
Hard resetting via RTS pin...";

    const CHIP_ID_V5: &str = "esptool v5.0.0
Connected to ESP32-S3 on /dev/ttyACM0:
Chip type:          ESP32-S3 (QFN56) (revision v0.2)
Features:           Wi-Fi, BT 5 (LE), Dual Core + LP Core, 240MHz
Crystal frequency:  40MHz
MAC:                f4:12:fa:00:00:01";

    #[test]
    fn progress_lines() {
        assert_eq!(parse_progress("Writing at 0x00010000... (2 %)"), Some(2));
        assert_eq!(parse_progress("Writing at 0x000f0000... (100 %)"), Some(100));
        assert_eq!(
            parse_progress("Writing at 0x0001c000 [====>   ] 14.3% 1024/8192 bytes..."),
            Some(14)
        );
        assert_eq!(
            parse_progress("Writing at 0x00020000 [==========] 100.0% 8192/8192 bytes..."),
            Some(100)
        );
        assert_eq!(parse_progress("Writing at 0x00010000 [>         ]"), None);
        assert_eq!(parse_progress("Wrote 983040 bytes at 0x00010000"), None);
    }

    #[test]
    fn chip_from_v4_output() {
        let chip = parse_chip(CHIP_ID_V4.lines()).unwrap();

        assert_eq!(chip.name, "ESP32-D0WD-V3");
        assert_eq!(chip.mac, "24:0a:c4:00:01:02");
        assert_eq!(chip.features.len(), 6);
        assert_eq!(chip.features[0], "WiFi");
    }

    #[test]
    fn chip_from_v5_output() {
        let chip = parse_chip(CHIP_ID_V5.lines()).unwrap();

        assert_eq!(chip.name, "ESP32-S3 (QFN56)");
        assert_eq!(chip.mac, "f4:12:fa:00:00:01");
        assert_eq!(chip.features[1], "BT 5 (LE)");
    }

    #[test]
    fn no_chip_without_name() {
        assert!(parse_chip("Connecting....\nMAC: 00:11:22:33:44:55".lines()).is_none());
    }

    #[test]
    fn fatal_error_preferred() {
        let out = "Connecting........_____
A fatal error occurred: Failed to connect to ESP32: No serial data received.
For troubleshooting steps visit: https://docs.espressif.com/";

        assert_eq!(
            failure_message(out.lines()).as_deref(),
            Some("Failed to connect to ESP32: No serial data received.")
        );
        assert_eq!(
            failure_message("foo\nbar\n\n".lines()).as_deref(),
            Some("bar")
        );
    }
}
