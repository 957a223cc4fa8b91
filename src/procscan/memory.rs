use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::LazyLock;

use nix::fcntl::{openat, OFlag};
use nix::sys::stat::Mode;
use regex::Regex;
use tracing::{debug, error};

use super::{read_at, ServerProcess, ServerProcessCollection};
use crate::error::{Error, Result};

static MAPPING_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9a-f]+)-([0-9a-f]+)\s").expect("valid regex"));
static ANONYMOUS_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Anonymous:\s*([0-9]+)").expect("valid regex"));
static RSS_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Rss:\s*([0-9]+)").expect("valid regex"));
static PSS_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Pss:\s*([0-9]+)").expect("valid regex"));

/// A pagemap entry with bit 63 set describes a resident page.
const PAGE_RESIDENT: u64 = 1 << 63;
/// Bits 0..52 of a pagemap entry hold the kernel page frame number.
const PFN_MASK: u64 = (1 << 53) - 1;

const CAP_SYS_ADMIN_BIT: u32 = 21;

/// One accumulated mapping from /proc/<pid>/smaps.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Mapping {
    start_addr: u64,
    end_addr: u64,
    rss_bytes: u64,
    pss_bytes: u64,
    anon_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PfnRange {
    start: u64,
    len: u64,
}

/// Whether this process can read real page frame numbers from pagemap.
///
/// Without CAP_SYS_ADMIN the kernel zeroes the PFN field, which makes
/// the USS computation meaningless. Checked once at startup against the
/// effective capability mask.
pub fn has_cap_sys_admin(proc_dir: &Path) -> bool {
    let path = proc_dir.join("self/status");
    let Ok(status) = fs::read_to_string(&path) else {
        return false;
    };

    for line in status.lines() {
        if let Some(mask) = line.strip_prefix("CapEff:") {
            if let Ok(mask) = u64::from_str_radix(mask.trim(), 16) {
                return mask & (1 << CAP_SYS_ADMIN_BIT) != 0;
            }
        }
    }

    false
}

/// Collect RSS, PSS, anonymous bytes, and (when pagemap access is
/// available) USS for every process in the collection.
///
/// Failures are per-process: a process that exits mid-collection keeps
/// whatever values were already computed and the rest of the collection
/// proceeds. Nothing propagates to the caller.
///
/// Returns whether kpagecount was open for this pass. When it was not
/// (no privilege, or the open failed), the USS fields were never
/// written and must not be emitted as measurements.
pub fn collect_memory_stats(
    collection: &mut ServerProcessCollection,
    proc_dir: &Path,
    has_cap_sys_admin: bool,
) -> bool {
    let page_size = page_size();

    let mut kpagecount = if has_cap_sys_admin {
        let path = proc_dir.join("kpagecount");
        match File::open(&path) {
            Ok(f) => Some(f),
            Err(e) => {
                // Unlike per-process races, this one is unexpected.
                error!(path = %path.display(), error = %e, "failed to open kpagecount");
                None
            }
        }
    } else {
        None
    };

    for proc in &mut collection.processes {
        if let Err(e) = collect_for_process(proc, kpagecount.as_mut(), page_size) {
            debug!(pid = proc.pid, error = %e, "memory collection abandoned for process");
        }
    }

    kpagecount.is_some()
}

fn collect_for_process(
    proc: &mut ServerProcess,
    kpagecount: Option<&mut File>,
    page_size: u64,
) -> Result<()> {
    let smaps = read_at(proc.proc_dir(), "smaps")?;
    let mappings = parse_smaps(&smaps)?;

    let pagemap_fd = openat(
        proc.proc_dir(),
        "pagemap",
        OFlag::O_RDONLY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .map_err(|e| Error::proc_io("pagemap", e.into()))?;
    let mut pagemap = File::from(pagemap_fd);

    if let Some(kpagecount) = kpagecount {
        proc.uss = compute_uss(&mut pagemap, kpagecount, &mappings, page_size)?;
    }

    proc.rss = mappings.iter().map(|m| m.rss_bytes).sum();
    proc.pss = mappings.iter().map(|m| m.pss_bytes).sum();
    proc.anon = mappings.iter().map(|m| m.anon_bytes).sum();

    Ok(())
}

/// Parse /proc/<pid>/smaps into per-mapping totals.
///
/// A hex `start-end` header opens a new mapping; Rss/Pss/Anonymous
/// lines record kilobyte values into it. The `[vsyscall]` mapping is
/// discarded because pagemap cannot describe it.
fn parse_smaps(data: &[u8]) -> Result<Vec<Mapping>> {
    let parse_err = |line: &str| Error::proc_parse("smaps", format!("bad line: {line}"));

    let text = String::from_utf8_lossy(data);

    let mut mappings = Vec::new();
    let mut current: Option<(Mapping, bool)> = None;

    for line in text.lines() {
        if let Some(caps) = MAPPING_HEADER.captures(line) {
            if let Some((mapping, keep)) = current.take() {
                if keep {
                    mappings.push(mapping);
                }
            }

            let start_addr =
                u64::from_str_radix(&caps[1], 16).map_err(|_| parse_err(line))?;
            let end_addr = u64::from_str_radix(&caps[2], 16).map_err(|_| parse_err(line))?;
            let keep = !line.ends_with("[vsyscall]");

            current = Some((
                Mapping {
                    start_addr,
                    end_addr,
                    ..Default::default()
                },
                keep,
            ));
        } else if let Some(caps) = ANONYMOUS_LINE.captures(line) {
            if let Some((mapping, _)) = current.as_mut() {
                mapping.anon_bytes =
                    caps[1].parse::<u64>().map_err(|_| parse_err(line))? * 1024;
            }
        } else if let Some(caps) = RSS_LINE.captures(line) {
            if let Some((mapping, _)) = current.as_mut() {
                mapping.rss_bytes =
                    caps[1].parse::<u64>().map_err(|_| parse_err(line))? * 1024;
            }
        } else if let Some(caps) = PSS_LINE.captures(line) {
            if let Some((mapping, _)) = current.as_mut() {
                mapping.pss_bytes =
                    caps[1].parse::<u64>().map_err(|_| parse_err(line))? * 1024;
            }
        }
    }

    if let Some((mapping, keep)) = current.take() {
        if keep {
            mappings.push(mapping);
        }
    }

    Ok(mappings)
}

/// Unique set size: bytes of resident memory mapped by this process and
/// nobody else.
///
/// For every mapping, the pagemap entries give the kernel PFN of each
/// resident page along with how many times *this* process maps it. The
/// system-wide mapping count of each such page comes from
/// /proc/kpagecount; a page whose system-wide count does not exceed our
/// own is unique to this process.
fn compute_uss(
    pagemap: &mut File,
    kpagecount: &mut File,
    mappings: &[Mapping],
    page_size: u64,
) -> Result<u64> {
    let mut pfn_counts: HashMap<u64, u64> = HashMap::new();

    for mapping in mappings {
        let start_pfn = mapping.start_addr / page_size;
        let end_pfn = mapping.end_addr / page_size;

        pagemap
            .seek(SeekFrom::Start(start_pfn * 8))
            .map_err(|e| Error::proc_io("pagemap", e))?;

        let mut buf = vec![0u8; ((end_pfn - start_pfn) * 8) as usize];
        pagemap
            .read_exact(&mut buf)
            .map_err(|e| Error::proc_io("pagemap", e))?;

        for chunk in buf.chunks_exact(8) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            if let Some(pfn) = resident_pfn(u64::from_ne_bytes(raw)) {
                *pfn_counts.entry(pfn).or_insert(0) += 1;
            }
        }
    }

    let mut pfns: Vec<u64> = pfn_counts.keys().copied().collect();
    pfns.sort_unstable();
    let ranges = coalesce_pfn_ranges(&pfns);

    let mut uss = 0u64;
    for range in &ranges {
        if kpagecount.seek(SeekFrom::Start(range.start * 8)).is_err() {
            continue;
        }
        let mut buf = vec![0u8; (range.len * 8) as usize];
        if kpagecount.read_exact(&mut buf).is_err() {
            continue;
        }

        for (i, chunk) in buf.chunks_exact(8).enumerate() {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            let system_count = u64::from_ne_bytes(raw);

            let pfn = range.start + i as u64;
            let ours = pfn_counts.get(&pfn).copied().unwrap_or(0);
            if system_count <= ours {
                uss += page_size;
            }
        }
    }

    Ok(uss)
}

/// Decode one pagemap entry: the kernel PFN if the page is resident and
/// the PFN is visible (nonzero), otherwise None.
fn resident_pfn(entry: u64) -> Option<u64> {
    if entry & PAGE_RESIDENT == 0 {
        return None;
    }
    let pfn = entry & PFN_MASK;
    (pfn != 0).then_some(pfn)
}

/// Coalesce sorted, deduplicated PFNs into contiguous ranges so
/// kpagecount can be read with one seek per run instead of one per
/// page.
fn coalesce_pfn_ranges(sorted_pfns: &[u64]) -> Vec<PfnRange> {
    let mut ranges: Vec<PfnRange> = Vec::new();

    for &pfn in sorted_pfns {
        match ranges.last_mut() {
            Some(range) if range.start + range.len == pfn => range.len += 1,
            _ => ranges.push(PfnRange { start: pfn, len: 1 }),
        }
    }

    ranges
}

fn page_size() -> u64 {
    // SAFETY: sysconf reads static system configuration and has no side
    // effects.
    let raw = unsafe { nix::libc::sysconf(nix::libc::_SC_PAGESIZE) };
    if raw > 0 {
        raw as u64
    } else {
        4096
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMAPS: &str = "\
559f1a200000-559f1a252000 r--p 00000000 fd:01 1573555 /usr/bin/ruby
Size:                328 kB
Rss:                 320 kB
Pss:                 106 kB
Anonymous:             0 kB
7f2e4c000000-7f2e4c400000 rw-p 00000000 00:00 0
Size:               4096 kB
Rss:                1024 kB
Pss:                1024 kB
Anonymous:          1024 kB
ffffffffff600000-ffffffffff601000 --xp 00000000 00:00 0 [vsyscall]
Size:                  4 kB
Rss:                   4 kB
Pss:                   4 kB
Anonymous:             0 kB
";

    #[test]
    fn test_parse_smaps_accumulates_mappings() {
        let mappings = parse_smaps(SMAPS.as_bytes()).expect("parse");
        assert_eq!(mappings.len(), 2);

        assert_eq!(mappings[0].start_addr, 0x559f_1a20_0000);
        assert_eq!(mappings[0].end_addr, 0x559f_1a25_2000);
        assert_eq!(mappings[0].rss_bytes, 320 * 1024);
        assert_eq!(mappings[0].pss_bytes, 106 * 1024);
        assert_eq!(mappings[0].anon_bytes, 0);

        assert_eq!(mappings[1].rss_bytes, 1024 * 1024);
        assert_eq!(mappings[1].anon_bytes, 1024 * 1024);
    }

    #[test]
    fn test_parse_smaps_discards_vsyscall() {
        let mappings = parse_smaps(SMAPS.as_bytes()).expect("parse");
        assert!(mappings
            .iter()
            .all(|m| m.start_addr != 0xffff_ffff_ff60_0000));
    }

    #[test]
    fn test_parse_smaps_empty() {
        assert!(parse_smaps(b"").expect("parse").is_empty());
    }

    #[test]
    fn test_resident_pfn() {
        assert_eq!(resident_pfn(0), None);
        // Resident bit set, pfn zero: kernel hides the frame number.
        assert_eq!(resident_pfn(PAGE_RESIDENT), None);
        assert_eq!(resident_pfn(PAGE_RESIDENT | 0x1234), Some(0x1234));
        // Not resident, pfn bits set anyway.
        assert_eq!(resident_pfn(0x1234), None);
        // Flag bits between the PFN and the resident bit are masked off.
        assert_eq!(
            resident_pfn(PAGE_RESIDENT | (1 << 55) | 42),
            Some(42),
        );
    }

    #[test]
    fn test_coalesce_pfn_ranges() {
        assert_eq!(coalesce_pfn_ranges(&[]), Vec::new());

        let ranges = coalesce_pfn_ranges(&[1, 2, 3, 7, 8, 20]);
        assert_eq!(
            ranges,
            vec![
                PfnRange { start: 1, len: 3 },
                PfnRange { start: 7, len: 2 },
                PfnRange { start: 20, len: 1 },
            ],
        );
    }

    #[test]
    fn test_collect_reports_uss_unavailable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut collection = ServerProcessCollection::default();

        // No privilege requested.
        assert!(!collect_memory_stats(&mut collection, dir.path(), false));
        // Privilege claimed, but no kpagecount file at this proc root.
        assert!(!collect_memory_stats(&mut collection, dir.path(), true));
    }

    #[test]
    fn test_cap_sys_admin_from_synthetic_status() {
        let dir = tempfile::tempdir().expect("tempdir");
        let self_dir = dir.path().join("self");
        fs::create_dir(&self_dir).expect("mkdir");

        fs::write(
            self_dir.join("status"),
            "Name:\ttest\nCapEff:\t0000000000200000\n",
        )
        .expect("write status");
        assert!(has_cap_sys_admin(dir.path()));

        fs::write(
            self_dir.join("status"),
            "Name:\ttest\nCapEff:\t0000000000000000\n",
        )
        .expect("write status");
        assert!(!has_cap_sys_admin(dir.path()));
    }
}
