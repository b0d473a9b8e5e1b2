// SPDX-License-Identifier: GPL-3.0-only

//! Conversion between structured multipath tables and the textual forms
//! used by `dmsetup`.

use std::fmt::Write as _;
use std::str::{FromStr, SplitWhitespace};

use multipath_types::{
    DevT, DmPathState, GroupState, GroupStatus, MULTIPATH_TARGET, MapInfo, MapStatus, MapTable,
    PathStatus, TableGroup,
};

use crate::{Result, SysError};

struct Tokens<'a> {
    line: &'a str,
    inner: SplitWhitespace<'a>,
}

impl<'a> Tokens<'a> {
    fn new(line: &'a str) -> Self {
        Self {
            line,
            inner: line.split_whitespace(),
        }
    }

    fn next(&mut self, what: &str) -> Result<&'a str> {
        self.inner
            .next()
            .ok_or_else(|| SysError::Parse(format!("missing {what} in '{}'", self.line)))
    }

    fn number<T: FromStr>(&mut self, what: &str) -> Result<T> {
        let token = self.next(what)?;
        token
            .parse()
            .map_err(|_| SysError::Parse(format!("invalid {what} '{token}' in '{}'", self.line)))
    }

    fn skip(&mut self, count: usize, what: &str) -> Result<()> {
        for _ in 0..count {
            self.next(what)?;
        }
        Ok(())
    }

    fn devt(&mut self) -> Result<DevT> {
        let token = self.next("path device")?;
        token.parse().map_err(SysError::Parse)
    }

    fn expect_multipath(&mut self) -> Result<u64> {
        let _start: u64 = self.number("start sector")?;
        let length: u64 = self.number("length")?;
        let target = self.next("target type")?;
        if target != MULTIPATH_TARGET {
            return Err(SysError::Parse(format!(
                "not a {MULTIPATH_TARGET} table: '{}'",
                self.line
            )));
        }
        Ok(length)
    }
}

/// Per-path selector arguments for the selectors we know about.
fn selector_path_args(selector: &str) -> &'static [&'static str] {
    match selector {
        "service-time" => &["1", "1"],
        _ => &["1"],
    }
}

/// Render `table` as a dm-multipath target line.
pub fn render_table(table: &MapTable) -> String {
    let mut out = format!("0 {} {}", table.size, MULTIPATH_TARGET);

    if table.queue_if_no_path {
        out.push_str(" 1 queue_if_no_path");
    } else {
        out.push_str(" 0");
    }

    // no hardware handler
    out.push_str(" 0");

    let initial = if table.groups.is_empty() {
        0
    } else {
        table.initial_group.min(table.groups.len() - 1) + 1
    };
    let _ = write!(out, " {} {}", table.groups.len(), initial);

    for group in &table.groups {
        let args = selector_path_args(&group.selector);
        let _ = write!(
            out,
            " {} 0 {} {}",
            group.selector,
            group.paths.len(),
            args.len()
        );
        for devt in &group.paths {
            let _ = write!(out, " {}", devt);
            for arg in args {
                let _ = write!(out, " {}", arg);
            }
        }
    }

    out
}

/// Parse the output of `dmsetup table` for a multipath map.
pub fn parse_table(line: &str) -> Result<MapTable> {
    let mut tokens = Tokens::new(line);
    let size = tokens.expect_multipath()?;

    let feature_count: usize = tokens.number("feature count")?;
    let mut queue_if_no_path = false;
    for _ in 0..feature_count {
        if tokens.next("feature")? == "queue_if_no_path" {
            queue_if_no_path = true;
        }
    }

    let handler_count: usize = tokens.number("hardware handler count")?;
    tokens.skip(handler_count, "hardware handler argument")?;

    let group_count: usize = tokens.number("group count")?;
    let initial: usize = tokens.number("initial group")?;

    let mut groups = Vec::new();
    for _ in 0..group_count {
        let selector = tokens.next("path selector")?.to_string();
        let selector_args: usize = tokens.number("selector argument count")?;
        tokens.skip(selector_args, "selector argument")?;

        let path_count: usize = tokens.number("path count")?;
        let path_args: usize = tokens.number("path argument count")?;

        let mut paths = Vec::new();
        for _ in 0..path_count {
            paths.push(tokens.devt()?);
            tokens.skip(path_args, "path argument")?;
        }
        groups.push(TableGroup { selector, paths });
    }

    Ok(MapTable {
        size,
        wwid: String::new(),
        queue_if_no_path,
        groups,
        initial_group: initial.saturating_sub(1),
    })
}

/// Parse the output of `dmsetup status` for a multipath map.
pub fn parse_status(line: &str) -> Result<MapStatus> {
    let mut tokens = Tokens::new(line);
    tokens.expect_multipath()?;

    let feature_count: usize = tokens.number("feature count")?;
    tokens.skip(feature_count, "feature")?;
    let handler_count: usize = tokens.number("hardware handler count")?;
    tokens.skip(handler_count, "hardware handler argument")?;

    let group_count: usize = tokens.number("group count")?;
    let _next_group: usize = tokens.number("next group")?;

    let mut groups = Vec::new();
    for _ in 0..group_count {
        let state = match tokens.next("group state")? {
            "A" => GroupState::Active,
            "E" => GroupState::Enabled,
            "D" => GroupState::Disabled,
            other => {
                return Err(SysError::Parse(format!("unknown group state '{other}'")));
            }
        };
        let selector_args: usize = tokens.number("selector status count")?;
        tokens.skip(selector_args, "selector status")?;

        let path_count: usize = tokens.number("path count")?;
        let path_args: usize = tokens.number("path status argument count")?;

        let mut paths = Vec::new();
        for _ in 0..path_count {
            let devt = tokens.devt()?;
            let state = match tokens.next("path state")? {
                "A" => DmPathState::Active,
                "F" => DmPathState::Failed,
                _ => DmPathState::Undefined,
            };
            let fail_count: u32 = tokens.number("fail count")?;
            tokens.skip(path_args, "path status argument")?;
            paths.push(PathStatus {
                devt,
                state,
                fail_count,
            });
        }
        groups.push(GroupStatus { state, paths });
    }

    Ok(MapStatus { groups })
}

/// Columns requested from `dmsetup info -c`.
pub const INFO_COLUMNS: &str = "name,major,minor,open,events,uuid";

/// Parse one line of `dmsetup info -c --noheadings --separator ';'`.
pub fn parse_info_line(line: &str) -> Result<MapInfo> {
    let fields: Vec<&str> = line.trim().split(';').collect();
    if fields.len() < 6 {
        return Err(SysError::Parse(format!("short info line '{line}'")));
    }

    let number = |index: usize, what: &str| -> Result<u32> {
        fields[index]
            .trim()
            .parse()
            .map_err(|_| SysError::Parse(format!("invalid {what} in '{line}'")))
    };

    Ok(MapInfo {
        name: fields[0].trim().to_string(),
        exists: true,
        devt: DevT::new(number(1, "major")?, number(2, "minor")?),
        open_count: number(3, "open count")?,
        event_nr: number(4, "event counter")?,
        uuid: fields[5].trim().to_string(),
        target: None,
    })
}

/// Names printed by `dmsetup ls`.
pub fn parse_ls(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("No devices found"))
        .filter_map(|line| line.split_whitespace().next())
        .map(ToString::to_string)
        .collect()
}

/// Target type of the first line of `dmsetup table`.
pub fn table_target(output: &str) -> Option<String> {
    output
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(2))
        .map(ToString::to_string)
}
