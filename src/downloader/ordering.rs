//! File processing order and archive volume naming conventions.
//!
//! Files are downloaded in a fixed priority order so playback can start as
//! early as possible:
//!
//! 1. checksum manifests (`.sfv`), then release records (`.srr`), by name
//! 2. the first archive volume, then every other volume by name
//! 3. recovery files (`.par2`), by name
//! 4. everything else, in manifest order

use regex::Regex;
use std::sync::OnceLock;

/// `.rar`, `.r00`..`.r999`, or a bare three-digit split suffix
#[allow(clippy::expect_used)]
fn volume_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\.(rar|r\d+|\d{3})$").expect("compile volume pattern"))
}

/// Whether `name` looks like any volume of a split archive
pub fn is_archive_volume(name: &str) -> bool {
    volume_pattern().is_match(name)
}

/// Check if a filename is the first volume of a RAR archive set.
///
/// Recognizes `archive.rar`, `archive.part01.rar` (any zero padding) and the
/// first piece of a plain split, `archive.001`. Returns `false` for `.r00`,
/// `.part02.rar` and `.002`.
pub fn is_first_volume(name: &str) -> bool {
    let lower = name.to_lowercase();

    if let Some(stem) = lower.strip_suffix(".rar") {
        if let Some(part_idx) = stem.rfind(".part") {
            let num_str = &stem[part_idx + 5..];
            if !num_str.is_empty() && num_str.chars().all(|c| c.is_ascii_digit()) {
                return num_str.parse::<u32>().map(|n| n == 1).unwrap_or(false);
            }
        }
        return true;
    }

    lower.ends_with(".001")
}

/// Check if a filename is a PAR2 recovery file
pub fn is_par2_file(name: &str) -> bool {
    name.to_lowercase().ends_with(".par2")
}

/// Check if a filename is an SFV checksum manifest
pub fn is_sfv_file(name: &str) -> bool {
    name.to_lowercase().ends_with(".sfv")
}

fn is_srr_file(name: &str) -> bool {
    name.to_lowercase().ends_with(".srr")
}

/// Check if a filename is a playable video container
pub fn is_video_file(name: &str) -> bool {
    let lower = name.to_lowercase();
    [".mkv", ".mp4", ".avi", ".m4v", ".ts"]
        .iter()
        .any(|ext| lower.ends_with(ext))
}

/// Index of the volume extraction has to start from
///
/// The first archive-like file (in manifest order) that is a first volume and
/// is not a subtitle archive wins. Without one, the first archive-like file is
/// used.
pub fn first_volume<S: AsRef<str>>(names: &[S]) -> Option<usize> {
    let volumes: Vec<usize> = names
        .iter()
        .enumerate()
        .filter(|(_, n)| is_archive_volume(n.as_ref()))
        .map(|(i, _)| i)
        .collect();

    volumes
        .iter()
        .copied()
        .find(|&i| {
            let name = names[i].as_ref();
            is_first_volume(name) && !name.to_lowercase().contains("subs")
        })
        .or_else(|| volumes.first().copied())
}

/// Order in which the files named `names` should be downloaded, as indices into `names`
pub fn processing_order<S: AsRef<str>>(names: &[S]) -> Vec<usize> {
    let mut taken = vec![false; names.len()];
    let mut order = Vec::with_capacity(names.len());

    let take_sorted = |predicate: &dyn Fn(&str) -> bool,
                       taken: &mut [bool],
                       order: &mut Vec<usize>| {
        let mut group: Vec<usize> = (0..names.len())
            .filter(|&i| !taken[i] && predicate(names[i].as_ref()))
            .collect();
        group.sort_by(|&a, &b| names[a].as_ref().cmp(names[b].as_ref()));
        for i in group {
            taken[i] = true;
            order.push(i);
        }
    };

    take_sorted(&is_sfv_file, &mut taken, &mut order);
    take_sorted(&is_srr_file, &mut taken, &mut order);

    if let Some(first) = first_volume(names)
        && !taken[first]
    {
        taken[first] = true;
        order.push(first);
    }
    take_sorted(&is_archive_volume, &mut taken, &mut order);
    take_sorted(&is_par2_file, &mut taken, &mut order);

    for (i, done) in taken.iter().enumerate() {
        if !done {
            order.push(i);
        }
    }
    order
}
