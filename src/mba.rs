// BWMAN MBA DRIVER
// APPLIES MEMORY BANDWIDTH ALLOCATION LEVELS THROUGH THE resctrl
// FILESYSTEM. THE BE CORES ARE ASSIGNED TO A DEDICATED CONTROL GROUP
// AND THE GROUP'S schemata THROTTLE IS WRITTEN DIRECTLY.
//
// resctrl ROUNDS REQUESTS TO WHAT THE HARDWARE SUPPORTS, SO EVERY
// APPLY READS BACK THE EFFECTIVE LEVEL AND RETURNS IT.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{bail, Context, Result};
use regex::Regex;

use crate::policy;

const RESCTRL_ROOT: &str = "/sys/fs/resctrl";
const GROUP_NAME: &str = "COS1";

pub struct MbaDriver {
    group: PathBuf,
    domain: u32,
    current: u32,
}

impl MbaDriver {
    // CREATES (OR REUSES) THE CONTROL GROUP AND PINS THE BE CORES TO IT.
    // domain IS THE resctrl MB DOMAIN ID, NORMALLY THE BE SOCKET.
    pub fn new(domain: u32, be_cores: &[u32]) -> Result<Self> {
        let root = Path::new(RESCTRL_ROOT);
        if !root.join("schemata").exists() {
            bail!(
                "{} is not mounted (mount -t resctrl resctrl /sys/fs/resctrl)",
                RESCTRL_ROOT
            );
        }
        let group = root.join(GROUP_NAME);
        if !group.exists() {
            std::fs::create_dir(&group)
                .with_context(|| format!("creating resctrl group {}", group.display()))?;
        }

        if !be_cores.is_empty() {
            let list = be_cores
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(",");
            std::fs::write(group.join("cpus_list"), &list)
                .with_context(|| format!("assigning cores {} to {}", list, GROUP_NAME))?;
        }

        let mut driver = Self {
            group,
            domain,
            current: policy::MBA_MAX,
        };
        // START UNTHROTTLED REGARDLESS OF WHAT A PREVIOUS RUN LEFT BEHIND
        driver.apply(policy::MBA_MAX)?;
        Ok(driver)
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    // WRITE THE THROTTLE LEVEL AND RETURN WHAT THE HARDWARE ACTUALLY
    // APPLIED. INVALID LEVELS ARE REJECTED BEFORE TOUCHING THE KERNEL.
    pub fn apply(&mut self, level: u32) -> Result<u32> {
        if !policy::is_valid_mba_level(level) {
            bail!("invalid mba level {}", level);
        }
        let schemata = self.group.join("schemata");
        std::fs::write(&schemata, format!("MB:{}={}\n", self.domain, level))
            .with_context(|| format!("writing {}", schemata.display()))?;

        let text = std::fs::read_to_string(&schemata)
            .with_context(|| format!("reading back {}", schemata.display()))?;
        let applied = parse_applied(&text, self.domain)
            .with_context(|| format!("no MB entry for domain {} in schemata", self.domain))?;
        if applied != level {
            eprintln!("[MBA]      requested {} applied {}", level, applied);
        }
        self.current = applied;
        Ok(applied)
    }

    // BEST-EFFORT RETURN TO FULL BANDWIDTH AT SHUTDOWN
    pub fn reset(&mut self) {
        if let Err(e) = self.apply(policy::MBA_MAX) {
            eprintln!("[MBA]      reset to {} failed: {:#}", policy::MBA_MAX, e);
        }
    }
}

// EXTRACT THE APPLIED PERCENTAGE FOR ONE MB DOMAIN FROM schemata TEXT,
// E.G. "MB:0= 40;1=100". TOLERATES PADDING AND MULTI-DOMAIN LINES.
fn parse_applied(text: &str, domain: u32) -> Option<u32> {
    // ANCHORED AT LINE START SO AN MB SUBSTRING INSIDE ANOTHER
    // RESOURCE LINE CANNOT MATCH. COMPILED ONCE.
    static MB_LINE: OnceLock<Regex> = OnceLock::new();
    let re = MB_LINE.get_or_init(|| Regex::new(r"(?m)^MB:(.*)$").unwrap());
    let line = re.captures(text)?.get(1)?.as_str();
    for part in line.split(';') {
        let mut it = part.splitn(2, '=');
        let dom: u32 = it.next()?.trim().parse().ok()?;
        let val: u32 = it.next()?.trim().parse().ok()?;
        if dom == domain {
            return Some(val);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_domain() {
        assert_eq!(parse_applied("MB:0=40\n", 0), Some(40));
    }

    #[test]
    fn parses_padded_multi_domain() {
        let text = "L3:0=fffff;1=fffff\nMB:0= 40;1=100\n";
        assert_eq!(parse_applied(text, 0), Some(40));
        assert_eq!(parse_applied(text, 1), Some(100));
    }

    #[test]
    fn missing_domain_is_none() {
        assert_eq!(parse_applied("MB:0=40\n", 3), None);
    }

    #[test]
    fn garbage_is_none() {
        assert_eq!(parse_applied("L3:0=fffff\n", 0), None);
    }

    #[test]
    fn mid_line_mb_substring_does_not_match() {
        let text = "L3:0=ffMB:7=7\nMB:0=40\n";
        assert_eq!(parse_applied(text, 7), None);
        assert_eq!(parse_applied(text, 0), Some(40));
    }
}
