//! Bug oracle collaborator: reports release-critical bugs that a pending
//! upgrade would pull in.

use anyhow::Result;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::process::Cmd;

/// Debian bug severities that gate an upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Critical,
    Grave,
    Serious,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Grave => "grave",
            Severity::Serious => "serious",
        }
    }
}

impl FromStr for Severity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Ok(Severity::Critical),
            "grave" => Ok(Severity::Grave),
            "serious" => Ok(Severity::Serious),
            other => anyhow::bail!("unsupported bug severity '{other}'"),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severities the freshness checker asks about.
pub const GATING_SEVERITIES: [Severity; 3] =
    [Severity::Critical, Severity::Grave, Severity::Serious];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BugIssue {
    pub severity: Severity,
    pub package: String,
    pub number: u64,
    pub title: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BugReport {
    pub issues: Vec<BugIssue>,
}

impl BugReport {
    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }
}

impl fmt::Display for BugReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for issue in &self.issues {
            writeln!(
                f,
                "  [{}] {} #{}: {}",
                issue.severity, issue.package, issue.number, issue.title
            )?;
        }
        Ok(())
    }
}

pub trait BugOracle {
    /// Issues at the given severities affecting the candidate versions of
    /// `packages`.
    fn issues(&self, severities: &[Severity], packages: &[String]) -> Result<BugReport>;
}

/// `apt-listbugs` run inside the environment. Needs `/proc` mounted there.
#[derive(Debug, Clone)]
pub struct AptListBugs {
    root: PathBuf,
}

impl AptListBugs {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }
}

impl BugOracle for AptListBugs {
    fn issues(&self, severities: &[Severity], packages: &[String]) -> Result<BugReport> {
        if packages.is_empty() {
            return Ok(BugReport::default());
        }
        let severity_arg = severities
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let output = Cmd::new("chroot")
            .arg_path(&self.root)
            .args(["apt-listbugs", "-s", &severity_arg, "-q", "list"])
            .args(packages)
            .env("LC_ALL", "C")
            .error_msg("apt-listbugs failed")
            .run()?;
        Ok(parse_listbugs(&output.stdout))
    }
}

/// Parse `apt-listbugs list` output.
///
/// ```text
/// critical bugs of libc6 (2.36-9 → 2.36-10) <Outstanding>
///  b1 - #1034567 - libc6: breaks boot
/// Summary:
///  libc6(1 bug)
/// ```
pub fn parse_listbugs(stdout: &str) -> BugReport {
    let mut report = BugReport::default();
    let mut current: Option<(Severity, String)> = None;

    for line in stdout.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("Summary:") {
            break;
        }

        if let Some((severity, rest)) = trimmed.split_once(" bugs of ") {
            current = match severity.parse::<Severity>() {
                Ok(severity) => rest
                    .split_whitespace()
                    .next()
                    .map(|package| (severity, package.to_string())),
                Err(_) => None,
            };
            continue;
        }

        let Some((severity, package)) = &current else {
            continue;
        };
        if let Some((number, title)) = parse_bug_line(trimmed) {
            report.issues.push(BugIssue {
                severity: *severity,
                package: package.clone(),
                number,
                title,
            });
        }
    }
    report
}

fn parse_bug_line(line: &str) -> Option<(u64, String)> {
    let mut parts = line.splitn(3, " - ");
    let tag = parts.next()?;
    if tag.len() < 2 || !tag.starts_with('b') || !tag[1..].chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let number = parts.next()?.trim().strip_prefix('#')?.parse().ok()?;
    let title = parts.next().unwrap_or("").trim().to_string();
    Some((number, title))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTBUGS: &str = "\
Retrieving bug reports... Done
Parsing Found/Fixed information... Done
critical bugs of libc6 (2.36-9+deb12u3 → 2.36-9+deb12u4) <Outstanding>
 b1 - #1034567 - libc6: segfault in ld.so on boot
serious bugs of systemd (252.22-1 → 252.26-1) <Outstanding>
 b2 - #1045678 - systemd: journald loses logs (Fixed: systemd/252.27-1)
 b3 - #1045999 - systemd: unit ordering cycle
Summary:
 libc6(1 bug), systemd(2 bugs)
";

    #[test]
    fn test_parse_listbugs() {
        let report = parse_listbugs(LISTBUGS);
        assert_eq!(report.issues.len(), 3);
        assert_eq!(
            report.issues[0],
            BugIssue {
                severity: Severity::Critical,
                package: "libc6".to_string(),
                number: 1034567,
                title: "libc6: segfault in ld.so on boot".to_string(),
            }
        );
        assert_eq!(report.issues[2].package, "systemd");
        assert_eq!(report.issues[2].severity, Severity::Serious);
    }

    #[test]
    fn test_parse_listbugs_empty() {
        let report = parse_listbugs("Retrieving bug reports... Done\n");
        assert!(report.is_empty());
    }

    #[test]
    fn test_ignores_non_gating_severities() {
        let report =
            parse_listbugs("important bugs of vim (9.0 → 9.1) <Outstanding>\n b1 - #1 - vim: meh\n");
        assert!(report.is_empty());
    }

    #[test]
    fn test_severity_parse() {
        assert_eq!("Grave".parse::<Severity>().unwrap(), Severity::Grave);
        assert!("minor".parse::<Severity>().is_err());
    }
}
