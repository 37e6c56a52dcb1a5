//! Long File Name encode/decode: name validity, long-entry layout,
//! short-name generation with collision resolution, directory lookup and
//! insert (spec §4.4).

use io_at::{ReadAt, WriteAt};

use crate::block_io::BlockIo;
use crate::directory::{self, read_entry, write_entry, EntryIter};
use crate::dirent::{
    first_byte, short_name_checksum, DirEntryView, DirPos, LongEntry, RawDirEntry, ShortEntry,
};
use crate::error::{Error, LfnError, Result};
use crate::fat::FatTable;

/// Bytes in the bit array used by [`find_free_index`] per search pass; one
/// pass covers `LFN_BIT_ARRAY_SIZE * 8` candidate indices (spec §4.4.2
/// item 4, see DESIGN.md's Open Question decision for the concrete value).
pub const LFN_BIT_ARRAY_SIZE: usize = 32;
/// Upper bound on the `~N` numeric suffix (spec §4.4.2 item 4).
pub const LFN_MAX_SHORT_NAME: u32 = 999_999;

/// Characters forbidden in a long name (spec §4.4.3): control characters,
/// DEL, and the reserved separator/wildcard set.
fn is_invalid_long_char(c: char) -> bool {
    (c as u32) < 0x20 || c == '\u{7F}' || matches!(c, '\\' | '/' | ':' | '*' | '?' | '<' | '>' | '|' | '"')
}

fn is_invalid_short_byte(b: u8) -> bool {
    b < 0x20 || b == 0x7F || matches!(b, b'\\' | b'/' | b':' | b'*' | b'?' | b'<' | b'>' | b'|' | b'"')
}

/// The character-set-converter collaborator (spec §6): `decode`/`encode`
/// of whole byte sequences and `get_info()` belong to the file API's
/// byte-level I/O path and stay out of scope here (spec §1 lists
/// character-set converters as an external collaborator, contract only).
/// Short-name generation only needs the piece of that contract spec
/// §4.4.2 actually exercises: folding a long-name character that has no
/// ASCII/OEM short-name representation to its best-fit equivalent before
/// falling back to `_`, and upper-casing per `to_upper`/`is_upper`.
///
/// `FS_FAT_LFN.c`'s `_GetOEMChar` (`examples/original_source/emFile/FS/FS_FAT_LFN.c:990-1011`)
/// routes every long-name character through `FS_pCharSetType->pfToOEM`
/// before the invalid-character check and only substitutes `_` when that
/// conversion itself reports `FS_WCHAR_INVALID` -- i.e. "not ASCII" and
/// "has no short-name representation" are different questions.
pub trait CharsetConv {
    /// Fold `c` to its short-name byte, or `None` if it has none (the
    /// caller then substitutes `_`, matching `_GetOEMChar`'s fallback).
    fn to_oem(&self, c: char) -> Option<u8>;
    /// Unicode-aware uppercasing, used both for the short-name fold above
    /// and for long-name comparison during lookup (spec §4.4.4).
    fn to_upper(&self, c: char) -> char;
}

/// Default [`CharsetConv`]: ASCII passes through unchanged; the common
/// Latin-1 Supplement / Latin Extended-A diacritics and ligatures fold to
/// their base letter (the "best-fit" table most OEM-codepage FAT
/// implementations in the retrieval pack's corpus ship as their default,
/// rather than rejecting every accented character outright).
#[derive(Debug, Clone, Copy, Default)]
pub struct Latin1BestFit;

impl CharsetConv for Latin1BestFit {
    fn to_oem(&self, c: char) -> Option<u8> {
        if c.is_ascii() {
            return Some(c as u8);
        }
        let folded = match c {
            'À'..='Å' | 'à'..='å' => 'A',
            'Æ' | 'æ' => 'A',
            'Ç' | 'ç' => 'C',
            'È'..='Ë' | 'è'..='ë' => 'E',
            'Ì'..='Ï' | 'ì'..='ï' => 'I',
            'Ð' | 'ð' => 'D',
            'Ñ' | 'ñ' => 'N',
            'Ò'..='Ö' | 'ò'..='ö' | 'Ø' | 'ø' => 'O',
            'Œ' | 'œ' => 'O',
            'Ù'..='Ü' | 'ù'..='ü' => 'U',
            'Ý' | 'ý' | 'ÿ' => 'Y',
            'ß' => 's',
            _ => return None,
        };
        Some(folded as u8)
    }

    fn to_upper(&self, c: char) -> char {
        match c.to_uppercase().next() {
            Some(u) if c.to_uppercase().count() == 1 => u,
            _ => c,
        }
    }
}

/// A [`CharsetConv`] usable without an allocation at call sites that just
/// need the default Latin-1 best-fit table (spec §4.4.2's name-generation
/// callers that never plug in a caller-supplied converter).
pub fn default_charset() -> &'static dyn CharsetConv {
    &Latin1BestFit
}

/// Trim leading spaces and trailing spaces/periods (spec §4.4.2 item 1,
/// and the `normalize` function in spec §8 property 5).
pub fn normalize_name(name: &str) -> String {
    name.trim_start_matches(' ')
        .trim_end_matches(|c| c == ' ' || c == '.')
        .to_string()
}

/// Reject names that are too long, all-dots, or contain a forbidden
/// character (spec §4.4.3).
pub fn validate_long_name(name: &str) -> Result<()> {
    let count = name.chars().count();
    if count == 0 || count > 255 {
        return Err(Error::Lfn(LfnError::TooLong(count)));
    }
    if name.chars().all(|c| c == '.') {
        return Err(Error::Lfn(LfnError::AllDots));
    }
    for c in name.chars() {
        if is_invalid_long_char(c) {
            return Err(Error::Lfn(LfnError::InvalidChar(c)));
        }
    }
    Ok(())
}

fn name_to_utf16(s: &str) -> Vec<u16> {
    s.encode_utf16().collect()
}

/// `ceil(NumChars / 13)` (spec §4.4.1). `NumChars` is counted in UTF-16
/// code units, matching what is physically stored 13-per-entry; the
/// distinction from Unicode code points only matters for names containing
/// surrogate-pair (non-BMP) characters.
pub fn entry_count(num_units: usize) -> usize {
    num_units.div_ceil(13).max(1)
}

/// Build the `N` long entries for `name_units`, in physical (on-disk)
/// order: the physically-first entry carries the highest ordinal and the
/// *last* chunk of the name (spec §4.4.1). Padding: the slot right after
/// the last character holds `U+0000`; remaining slots hold `U+FFFF`;
/// neither is written when `name_units.len()` is an exact multiple of 13.
pub fn build_long_entries(name_units: &[u16], checksum: u8) -> Vec<LongEntry> {
    let n = entry_count(name_units.len());
    let mut entries = Vec::with_capacity(n);
    for i in 0..n {
        let ordinal = (n - i) as u8;
        let start = (ordinal as usize - 1) * 13;
        let mut units = [0xFFFFu16; 13];
        for j in 0..13 {
            let idx = start + j;
            if idx < name_units.len() {
                units[j] = name_units[idx];
            } else if idx == name_units.len() {
                units[j] = 0x0000;
            }
        }
        entries.push(LongEntry {
            ordinal,
            is_last: i == 0,
            checksum,
            name_units: units,
        });
    }
    entries
}

/// Re-assemble a name from a complete, checksum-consistent run of long
/// entries given in ordinal-descending physical order (the same order
/// [`build_long_entries`] produces), trimming trailing terminator/padding.
pub fn decode_long_name(entries: &[LongEntry]) -> Result<String> {
    let n = entries.len();
    let mut units = vec![0u16; n * 13];
    for e in entries {
        let start = (e.ordinal as usize - 1) * 13;
        if start + 13 > units.len() {
            return Err(Error::Lfn(LfnError::EntryNotFound));
        }
        units[start..start + 13].copy_from_slice(&e.name_units);
    }
    // Trim at the first terminator/padding unit, if any.
    if let Some(end) = units.iter().position(|&u| u == 0x0000) {
        units.truncate(end);
    } else {
        while units.last() == Some(&0xFFFF) {
            units.pop();
        }
    }
    String::from_utf16(&units).map_err(|_| Error::Lfn(LfnError::InvalidChar('\u{FFFD}')))
}

fn upper_utf16(u: u16) -> u16 {
    if let Some(c) = char::from_u32(u as u32) {
        let mut buf = [0u16; 2];
        let upper: Vec<char> = c.to_uppercase().collect();
        if upper.len() == 1 {
            let encoded = upper[0].encode_utf16(&mut buf);
            if encoded.len() == 1 {
                return encoded[0];
            }
        }
    }
    u
}

fn short_name_as_string(name83: &[u8; 11]) -> String {
    let mut base = name83[0..8].to_vec();
    if base[0] == first_byte::ESCAPED_E5 {
        base[0] = first_byte::DELETED;
    }
    let base_len = base.iter().rposition(|&b| b != b' ').map(|p| p + 1).unwrap_or(0);
    let ext_len = name83[8..11].iter().rposition(|&b| b != b' ').map(|p| p + 1).unwrap_or(0);
    let mut s = String::from_utf8_lossy(&base[..base_len]).into_owned();
    if ext_len > 0 {
        s.push('.');
        s.push_str(&String::from_utf8_lossy(&name83[8..8 + ext_len]));
    }
    s
}

/// `_GetOEMChar`'s per-character pipeline (spec §4.4.2 item 3): try the
/// converter's best-fit fold first, upper-case, then reject characters
/// still invalid for a short name -- only then does `_` mean "truly
/// unrepresentable", not merely "non-ASCII".
fn sanitize_short_char(charset: &dyn CharsetConv, c: char) -> u8 {
    let folded = if c.is_ascii() { c as u8 } else { charset.to_oem(c).unwrap_or(b'_') };
    let b = charset.to_upper(folded as char);
    let b = if b.is_ascii() { b as u8 } else { b'_' };
    if is_invalid_short_byte(b) || b == b' ' {
        b'_'
    } else {
        b
    }
}

fn derive_stem_and_ext(charset: &dyn CharsetConv, trimmed: &str) -> (Vec<u8>, [u8; 3]) {
    let last_dot = trimmed.rfind('.');
    let (base_part, ext_part) = match last_dot {
        Some(p) if p > 0 => (&trimmed[..p], &trimmed[p + 1..]),
        _ => (trimmed, ""),
    };
    let stem: Vec<u8> = base_part.chars().filter(|c| !c.is_whitespace()).map(|c| sanitize_short_char(charset, c)).collect();
    let stem = if stem.is_empty() { vec![b'_'] } else { stem };
    let mut ext = [b' '; 3];
    let ext_sanitized: Vec<u8> = ext_part.chars().take(3).map(|c| sanitize_short_char(charset, c)).collect();
    ext[..ext_sanitized.len()].copy_from_slice(&ext_sanitized);
    (stem, ext)
}

/// `try_direct_8_3` implements spec §4.4.2 item 2: a name that already
/// fits 8.3 after uppercasing, with no invalid characters, is stored as-is
/// with no LFN entries.
fn try_direct_8_3(trimmed: &str) -> Option<[u8; 11]> {
    if trimmed.is_empty() || !trimmed.is_ascii() {
        return None;
    }
    let upper: Vec<u8> = trimmed.bytes().map(|b| b.to_ascii_uppercase()).collect();
    let dot_positions: Vec<usize> = upper.iter().enumerate().filter(|&(_, &b)| b == b'.').map(|(i, _)| i).collect();
    if dot_positions.len() > 1 {
        return None;
    }
    let (base, ext): (&[u8], &[u8]) = match dot_positions.first() {
        Some(&p) => (&upper[..p], &upper[p + 1..]),
        None => (&upper[..], &[]),
    };
    if base.is_empty() || base.len() > 8 || ext.len() > 3 {
        return None;
    }
    if base.iter().chain(ext.iter()).any(|&b| is_invalid_short_byte(b) || b == b' ') {
        return None;
    }
    let mut name83 = [b' '; 11];
    name83[..base.len()].copy_from_slice(base);
    name83[8..8 + ext.len()].copy_from_slice(ext);
    if name83[0] == first_byte::DELETED {
        name83[0] = first_byte::ESCAPED_E5;
    }
    Some(name83)
}

fn extract_index(name83: &[u8; 11], stem: &[u8], ext: &[u8; 3]) -> Option<u32> {
    if &name83[8..11] != ext {
        return None;
    }
    let base = &name83[0..8];
    let tilde_pos = base.iter().position(|&b| b == b'~')?;
    let digits: Vec<u8> = base[tilde_pos + 1..].iter().cloned().take_while(|&b| b != b' ').collect();
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let idx: u32 = std::str::from_utf8(&digits).ok()?.parse().ok()?;
    let expected_prefix_len = 8usize.saturating_sub(1).saturating_sub(digits.len()).max(1);
    let expected_prefix: Vec<u8> = stem.iter().take(expected_prefix_len).cloned().collect();
    if &base[..tilde_pos] == expected_prefix.as_slice() {
        Some(idx)
    } else {
        None
    }
}

/// Smallest `index >= 1` such that `(stem, ext)` is not already used in the
/// directory, via the indexed bitmap-pass search from spec §4.4.2 item 4.
fn find_free_index(existing: &[[u8; 11]], stem: &[u8], ext: &[u8; 3]) -> Result<u32> {
    let bits_per_pass = (LFN_BIT_ARRAY_SIZE * 8) as u32;
    let mut pass_start: u32 = 1;
    while pass_start <= LFN_MAX_SHORT_NAME {
        let mut bits = vec![0u8; LFN_BIT_ARRAY_SIZE];
        for name in existing {
            if let Some(idx) = extract_index(name, stem, ext) {
                if idx >= pass_start && idx < pass_start + bits_per_pass {
                    let rel = (idx - pass_start) as usize;
                    bits[rel / 8] |= 1 << (rel % 8);
                }
            }
        }
        for rel in 0..bits_per_pass {
            if bits[(rel / 8) as usize] & (1 << (rel % 8)) == 0 {
                let idx = pass_start + rel;
                if idx >= 1 && idx <= LFN_MAX_SHORT_NAME {
                    return Ok(idx);
                }
            }
        }
        pass_start += bits_per_pass;
    }
    Err(Error::Lfn(LfnError::NoFreeShortName))
}

/// Outcome of generating a short name for a given long name (spec §4.4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShortNameResult {
    pub name83: [u8; 11],
    /// `false` when the name was already 8.3-shaped and is stored without
    /// any accompanying LFN entries.
    pub needs_lfn: bool,
}

/// Generate an 8.3 short name for `trimmed`, given the 11-byte short names
/// already present in the target directory (spec §4.4.2). `charset`
/// supplies the best-fit fold for characters outside plain ASCII (spec
/// §6's `CharsetConv` contract); pass [`default_charset`] absent a
/// caller-supplied converter.
pub fn generate_short_name(charset: &dyn CharsetConv, trimmed: &str, existing: &[[u8; 11]]) -> Result<ShortNameResult> {
    if let Some(direct) = try_direct_8_3(trimmed) {
        if !existing.contains(&direct) {
            return Ok(ShortNameResult { name83: direct, needs_lfn: false });
        }
    }
    let (stem, ext) = derive_stem_and_ext(charset, trimmed);
    let idx = find_free_index(existing, &stem, &ext)?;
    let digits = idx.to_string().into_bytes();
    let trunc_len = 8usize.saturating_sub(1).saturating_sub(digits.len()).max(1);

    let mut base = [b' '; 8];
    let stem_trunc: Vec<u8> = stem.iter().take(trunc_len).cloned().collect();
    base[..stem_trunc.len()].copy_from_slice(&stem_trunc);
    base[stem_trunc.len()] = b'~';
    base[stem_trunc.len() + 1..stem_trunc.len() + 1 + digits.len()].copy_from_slice(&digits);

    let mut name83 = [b' '; 11];
    name83[0..8].copy_from_slice(&base);
    name83[8..11].copy_from_slice(&ext);
    if name83[0] == first_byte::DELETED {
        name83[0] = first_byte::ESCAPED_E5;
    }
    Ok(ShortNameResult { name83, needs_lfn: true })
}

struct LfnGroupAcc {
    n: u8,
    next_expected_ordinal: u8,
    checksum: u8,
    units: Vec<u16>,
    broken: bool,
}

impl LfnGroupAcc {
    fn new(first: LongEntry) -> Self {
        let n = first.ordinal;
        let mut units = vec![0u16; n as usize * 13];
        let start = (n as usize - 1) * 13;
        units[start..start + 13].copy_from_slice(&first.name_units);
        LfnGroupAcc {
            n,
            next_expected_ordinal: n.saturating_sub(1),
            checksum: first.checksum,
            units,
            broken: false,
        }
    }

    fn push(&mut self, e: LongEntry) {
        if self.broken {
            return;
        }
        if e.ordinal != self.next_expected_ordinal || e.checksum != self.checksum || e.ordinal == 0 {
            self.broken = true;
            return;
        }
        let start = (e.ordinal as usize - 1) * 13;
        self.units[start..start + 13].copy_from_slice(&e.name_units);
        self.next_expected_ordinal = e.ordinal - 1;
    }

    fn complete(&self) -> bool {
        !self.broken && self.next_expected_ordinal == 0
    }

    fn upper_units(&self) -> Vec<u16> {
        self.units.iter().map(|&u| upper_utf16(u)).collect()
    }
}

/// Result of a successful directory lookup (spec §4.4.4).
#[derive(Debug, Clone, Copy)]
pub struct LookupMatch {
    pub pos: DirPos,
    pub short: ShortEntry,
}

/// Scan `parent_cluster`'s entry sequence for `target`, matching either a
/// complete, checksum-consistent LFN group or a directly-equivalent short
/// name (spec §4.4.4). `required_attr_mask` bits must all be set on a
/// candidate short entry's attribute byte (0 to not filter).
pub fn lookup<D: ReadAt + WriteAt>(
    table: &FatTable,
    io: &mut BlockIo<D>,
    parent_cluster: u32,
    target: &str,
    required_attr_mask: u8,
) -> Result<Option<LookupMatch>> {
    let normalized = normalize_name(target);
    let target_units = name_to_utf16(&normalized);
    let target_upper: Vec<u16> = target_units.iter().map(|&u| upper_utf16(u)).collect();
    let n = entry_count(target_units.len()) as u8;

    let mut iter = EntryIter::from(DirPos::root(parent_cluster));
    let mut group: Option<LfnGroupAcc> = None;

    while let Some((pos, raw)) = iter.next(table, io)? {
        let view = RawDirEntry(&raw);
        if view.is_end() {
            break;
        }
        if view.is_deleted() {
            group = None;
            continue;
        }
        match view.decode() {
            DirEntryView::Long(l) => {
                let le = LongEntry::from_view(&l);
                if le.is_last {
                    group = Some(LfnGroupAcc::new(le));
                } else if let Some(g) = group.as_mut() {
                    g.push(le);
                }
            }
            DirEntryView::Short(s) => {
                let short = ShortEntry::from_view(&s);
                let lfn_group = group.take();
                let matched_via_lfn = match &lfn_group {
                    Some(g) if g.n == n && g.complete() => {
                        short_name_checksum(&short.name83) == g.checksum && g.upper_units()[..target_upper.len().min(g.units.len())] == target_upper[..]
                    }
                    _ => false,
                };
                let matched_via_sfn = short_name_as_string(&short.name83).eq_ignore_ascii_case(&normalized);
                if (matched_via_lfn || matched_via_sfn) && short.attr & required_attr_mask == required_attr_mask {
                    return Ok(Some(LookupMatch { pos, short }));
                }
            }
        }
    }
    Ok(None)
}

/// Locate a run of `needed` consecutive free (end-of-directory or
/// deleted) slots, growing the directory (if it is a cluster chain) when
/// the current capacity runs out (spec §4.4.5).
fn find_free_run<D: ReadAt + WriteAt>(table: &FatTable, io: &mut BlockIo<D>, parent_cluster: u32, needed: u32) -> Result<DirPos> {
    let mut run_start: Option<u32> = None;
    let mut run_len = 0u32;
    let mut idx = 0u32;
    loop {
        let pos = DirPos { parent_cluster, entry_index: idx };
        let raw = match read_entry(table, io, pos)? {
            Some(r) => r,
            None => {
                directory::grow(table, io, parent_cluster)?;
                read_entry(table, io, pos)?.ok_or(Error::Lfn(LfnError::DiskFull))?
            }
        };
        let view = RawDirEntry(&raw);
        if view.is_end() || view.is_deleted() {
            if run_start.is_none() {
                run_start = Some(idx);
            }
            run_len += 1;
            if run_len >= needed {
                return Ok(DirPos { parent_cluster, entry_index: run_start.unwrap() });
            }
        } else {
            run_start = None;
            run_len = 0;
        }
        idx += 1;
    }
}

/// Insert `name` into `parent_cluster`'s directory, writing its LFN group
/// (if needed) and short entry (spec §4.4.5). `short_template` supplies
/// the attribute/time/cluster/size fields; its `name83` is overwritten
/// with the generated short name. `existing_names` is every 11-byte short
/// name already present, used for collision resolution. `charset` is the
/// [`CharsetConv`] short-name generation folds non-ASCII characters
/// through; pass [`default_charset`] absent a caller-supplied converter.
pub fn insert<D: ReadAt + WriteAt>(
    table: &FatTable,
    io: &mut BlockIo<D>,
    parent_cluster: u32,
    name: &str,
    mut short_template: ShortEntry,
    existing_names: &[[u8; 11]],
    charset: &dyn CharsetConv,
) -> Result<(DirPos, ShortEntry)> {
    let trimmed = normalize_name(name);
    validate_long_name(&trimmed)?;
    let result = generate_short_name(charset, &trimmed, existing_names)?;
    short_template.name83 = result.name83;
    let checksum = short_name_checksum(&result.name83);

    let long_entries = if result.needs_lfn {
        build_long_entries(&name_to_utf16(&trimmed), checksum)
    } else {
        Vec::new()
    };
    let total_needed = long_entries.len() as u32 + 1;

    let start = find_free_run(table, io, parent_cluster, total_needed)?;
    for (i, le) in long_entries.iter().enumerate() {
        let pos = DirPos { parent_cluster, entry_index: start.entry_index + i as u32 };
        write_entry(table, io, pos, &le.encode())?;
    }
    let sfn_pos = DirPos { parent_cluster, entry_index: start.entry_index + long_entries.len() as u32 };
    write_entry(table, io, sfn_pos, &short_template.encode())?;
    Ok((sfn_pos, short_template))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_count_exact_multiple_of_13_has_no_padding() {
        let units = name_to_utf16("ABCDEFGHIJKLM"); // 13 chars
        assert_eq!(entry_count(units.len()), 1);
        let entries = build_long_entries(&units, 0);
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].name_units.contains(&0x0000));
        assert!(!entries[0].name_units.contains(&0xFFFF));
    }

    #[test]
    fn build_long_entries_pads_tail_with_terminator_and_ffff() {
        let units = name_to_utf16("HELLO"); // 5 chars
        let entries = build_long_entries(&units, 0xAB);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name_units[5], 0x0000);
        assert_eq!(entries[0].name_units[6], 0xFFFF);
        assert_eq!(entries[0].name_units[12], 0xFFFF);
        assert!(entries[0].is_last);
        assert_eq!(entries[0].ordinal, 1);
    }

    #[test]
    fn decode_long_name_round_trips_through_build() {
        let name = "a long filename example";
        let units = name_to_utf16(name);
        let entries = build_long_entries(&units, 0x11);
        let decoded = decode_long_name(&entries).unwrap();
        assert_eq!(decoded, name);
    }

    #[test]
    fn all_dot_name_rejected() {
        assert!(matches!(validate_long_name("..."), Err(Error::Lfn(LfnError::AllDots))));
    }

    #[test]
    fn invalid_char_rejected() {
        assert!(matches!(validate_long_name("bad?name"), Err(Error::Lfn(LfnError::InvalidChar('?')))));
    }

    #[test]
    fn direct_8_3_name_needs_no_lfn() {
        let r = generate_short_name(default_charset(), "README.TXT", &[]).unwrap();
        assert!(!r.needs_lfn);
        assert_eq!(&r.name83, b"README  TXT");
    }

    #[test]
    fn long_name_generates_indexed_short_name() {
        let r = generate_short_name(default_charset(), "This Is A Very Long Name.txt", &[]).unwrap();
        assert!(r.needs_lfn);
        assert_eq!(&r.name83[8..11], b"TXT");
        assert_eq!(r.name83[0..7], *b"THISIS~");
        assert_eq!(r.name83[7], b'1');
    }

    #[test]
    fn short_name_collision_advances_index() {
        // S5: FILEN~63.TXT already present, new name should get FILEN~64.TXT.
        let mut existing = Vec::new();
        let mut direct = [b' '; 11];
        direct[0..8].copy_from_slice(b"FILENAME");
        direct[8..11].copy_from_slice(b"TXT");
        existing.push(direct);
        for i in 1..=63u32 {
            let digits = i.to_string().into_bytes();
            let trunc = 8 - 1 - digits.len();
            let mut base = [b' '; 8];
            base[..trunc].copy_from_slice(&b"FILENAME"[..trunc]);
            base[trunc] = b'~';
            base[trunc + 1..trunc + 1 + digits.len()].copy_from_slice(&digits);
            let mut name83 = [b' '; 11];
            name83[0..8].copy_from_slice(&base);
            name83[8..11].copy_from_slice(b"TXT");
            existing.push(name83);
        }
        let r = generate_short_name(default_charset(), "FileNameVeryLong64.txt", &existing).unwrap();
        assert!(r.needs_lfn);
        assert_eq!(&r.name83[8..11], b"TXT");
        let s = short_name_as_string(&r.name83);
        assert_eq!(s, "FILEN~64.TXT");
    }

    #[test]
    fn normalize_trims_leading_space_and_trailing_dot() {
        assert_eq!(normalize_name("  note.txt.."), "note.txt");
    }

    #[test]
    fn non_ascii_long_name_folds_through_charset_conv_s3() {
        // S3: "Ærøskøbing & co.txt" -> SFN "AROSKO~1.TXT" (best-fit fold,
        // not a blanket "non-ASCII is invalid" substitution).
        let r = generate_short_name(default_charset(), "Ærøskøbing & co.txt", &[]).unwrap();
        assert!(r.needs_lfn);
        let s = short_name_as_string(&r.name83);
        assert_eq!(s, "AROSKO~1.TXT");
    }
}
