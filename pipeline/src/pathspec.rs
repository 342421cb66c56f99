//! Filename and text templating with capture-state conversion specifiers.
//!
//! Templates mix strftime specifiers (handled by chrono) with
//! daemon-specific ones describing the frame being written: `%v` event
//! number, `%q` shot number, `%D` diff count, `%N` noise level, `%i`/`%J`
//! frame width/height, `%K`/`%L` motion centroid, `%o` threshold, `%Q`
//! label count, `%t` camera id, `%C` event text, `%f` filename and `%n`
//! file type.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local};

/// Frame state consulted by the daemon-specific specifiers.
#[derive(Clone, Debug, Default)]
pub struct SpecContext<'a> {
    pub camera_id: usize,
    pub event_nr: u32,
    pub shot: i32,
    pub diffs: i32,
    pub noise: i32,
    pub threshold: i32,
    pub width: usize,
    pub height: usize,
    pub centroid_x: i32,
    pub centroid_y: i32,
    pub total_labels: i32,
    pub event_text: &'a str,
    pub filename: Option<&'a str>,
    pub filetype: Option<&'a str>,
}

/// Expands a template against the frame context and timestamp. Unknown
/// strftime specifiers render the template literally rather than failing
/// a save.
pub fn expand(template: &str, ts: &DateTime<Local>, ctx: &SpecContext<'_>) -> String {
    let mut strftime = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            strftime.push(c);
            continue;
        }
        match chars.peek() {
            Some('v') => {
                chars.next();
                strftime.push_str(&format!("{:02}", ctx.event_nr));
            }
            Some('q') => {
                chars.next();
                strftime.push_str(&format!("{:02}", ctx.shot));
            }
            Some('D') => {
                chars.next();
                strftime.push_str(&ctx.diffs.to_string());
            }
            Some('N') => {
                chars.next();
                strftime.push_str(&ctx.noise.to_string());
            }
            Some('i') => {
                chars.next();
                strftime.push_str(&ctx.width.to_string());
            }
            Some('J') => {
                chars.next();
                strftime.push_str(&ctx.height.to_string());
            }
            Some('K') => {
                chars.next();
                strftime.push_str(&ctx.centroid_x.to_string());
            }
            Some('L') => {
                chars.next();
                strftime.push_str(&ctx.centroid_y.to_string());
            }
            Some('o') => {
                chars.next();
                strftime.push_str(&ctx.threshold.to_string());
            }
            Some('Q') => {
                chars.next();
                strftime.push_str(&ctx.total_labels.to_string());
            }
            Some('t') => {
                chars.next();
                strftime.push_str(&ctx.camera_id.to_string());
            }
            Some('C') => {
                chars.next();
                strftime.push_str(ctx.event_text);
            }
            Some('f') => {
                chars.next();
                strftime.push_str(ctx.filename.unwrap_or(""));
            }
            Some('n') => {
                chars.next();
                strftime.push_str(ctx.filetype.unwrap_or(""));
            }
            _ => strftime.push('%'), // leave for chrono
        }
    }

    // Bail out to the literal text if chrono cannot parse what is left;
    // a bad template must not abort a frame save.
    let items: Vec<Item> = StrftimeItems::new(&strftime).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return strftime;
    }
    ts.format(&strftime).to_string()
}
