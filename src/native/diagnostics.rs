use std::sync::LazyLock;

use itertools::Itertools;
use regex::Regex;

use crate::core::result::Diagnostic;

const PATTERN_ERR: &str = "diagnostic pattern is a valid regex";

// Program.cs(5,10): error CS1002: ; expected
// Program.cs(5,10,5,11): error CS1002: ; expected [/app/App.csproj]
static LOCATED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<file>[^()]+)\((?P<line>\d+),\d+(?:,(?P<end>\d+),\d+)?\):\s*(?P<severity>error|warning)\s+(?P<code>[A-Za-z]+\d+)\s*:\s*(?P<msg>.*?)(?:\s+\[[^\]]*\])?$",
    )
    .expect(PATTERN_ERR)
});

// error CS5001: Program does not contain a static 'Main' method
static UNLOCATED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:[^:]*:\s*)?(?P<severity>error|warning)\s+(?P<code>[A-Za-z]+\d+)\s*:\s*(?P<msg>.*?)(?:\s+\[[^\]]*\])?$",
    )
    .expect(PATTERN_ERR)
});

/// Extracts error-severity compiler diagnostics from raw tool output,
/// in order of first appearance and without duplicates.
pub fn parse(output: &str) -> Vec<Diagnostic> {
    output
        .lines()
        .map(str::trim)
        .filter_map(parse_line)
        .unique()
        .collect()
}

fn parse_line(line: &str) -> Option<Diagnostic> {
    if let Some(caps) = LOCATED.captures(line) {
        if &caps["severity"] != "error" {
            return None;
        }
        let start: u32 = caps["line"].parse().ok()?;
        let end = caps
            .name("end")
            .and_then(|end| end.as_str().parse().ok())
            .unwrap_or(start);
        return Some(Diagnostic::new(&caps["code"], &caps["msg"]).with_lines(start, end));
    }

    let caps = UNLOCATED.captures(line)?;
    if &caps["severity"] != "error" {
        return None;
    }
    Some(Diagnostic::new(&caps["code"], &caps["msg"]))
}
