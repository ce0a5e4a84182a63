//! Minimal ISO9660 image writer with Joliet names.
//!
//! Produces a single-directory image, enough for a cloud-init NoCloud seed.
//! Timestamps are zeroed so identical inputs give identical bytes.
//!
//! # Layout
//!
//! ```text
//! sector  0..16   system area (zero)
//! sector 16       primary volume descriptor
//! sector 17       Joliet supplementary volume descriptor
//! sector 18       descriptor set terminator
//! sector 19..23   path tables (primary L/M, Joliet L/M)
//! sector 23       primary root directory
//! sector 24       Joliet root directory
//! sector 25..     file data, sector aligned
//! ```

use std::fs;
use std::io::{self, Write as _};
use std::path::Path;

/// Logical sector size.
pub const SECTOR: usize = 2048;

/// Smallest image ever written (10 MiB).
pub const MIN_IMAGE_SIZE: u64 = 10 * 1024 * 1024;

const PRIMARY: u32 = 16;
const JOLIET: u32 = 17;
const TERMINATOR: u32 = 18;
const PRIMARY_L_TABLE: u32 = 19;
const PRIMARY_M_TABLE: u32 = 20;
const JOLIET_L_TABLE: u32 = 21;
const JOLIET_M_TABLE: u32 = 22;
const PRIMARY_ROOT: u32 = 23;
const JOLIET_ROOT: u32 = 24;
const FIRST_DATA: u32 = 25;

/// Size of the single path table record describing the root.
const PATH_TABLE_LEN: u32 = 10;

/// Directory flag in a directory record.
const FLAG_DIR: u8 = 0x02;

/// "Unspecified" descriptor timestamp: sixteen ASCII zeros and a zero offset.
const NO_DATE: [u8; 17] = *b"0000000000000000\0";

/// Image size for `payload` bytes of file data: `max(payload, 10 MiB)`,
/// rounded up to whole sectors.
pub const fn image_size(payload: u64) -> u64 {
    let size = if payload > MIN_IMAGE_SIZE {
        payload
    } else {
        MIN_IMAGE_SIZE
    };
    size.div_ceil(SECTOR as u64) * SECTOR as u64
}

/// Packs every regular file in `src` into an image at `dest`.
///
/// Nested directories are rejected. Returns the image size in bytes.
pub fn create_from_dir(src: &Path, label: &str, dest: &Path) -> io::Result<u64> {
    let mut files = Vec::new();
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{}: only regular files are supported", entry.path().display()),
            ));
        }
        let name = entry.file_name().into_string().map_err(|name| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{}: file name is not UTF-8", name.to_string_lossy()),
            )
        })?;
        files.push((name, fs::read(entry.path())?));
    }
    write_image(dest, label, &files)
}

/// One file as it appears in both directory trees.
struct Entry<'a> {
    /// Primary (ISO9660 level 2) identifier, including `;1`.
    primary: Vec<u8>,
    /// Joliet identifier, UCS-2 big-endian.
    joliet: Vec<u8>,
    /// First data sector.
    extent: u32,
    /// Contents.
    data: &'a [u8],
    /// `data.len()`.
    len: u32,
}

/// Writes an image containing `files` in its root directory.
///
/// Returns the image size in bytes.
pub fn write_image(dest: &Path, label: &str, files: &[(String, Vec<u8>)]) -> io::Result<u64> {
    if label.is_empty() || label.len() > 16 || !label.is_ascii() {
        return Err(invalid(format!("volume label {label:?} must be 1-16 ASCII characters")));
    }

    let mut entries = Vec::with_capacity(files.len());
    let mut next = FIRST_DATA;
    for (name, data) in files {
        if name.is_empty() || name.encode_utf16().count() > 64 || name.contains('/') {
            return Err(invalid(format!("file name {name:?} is not representable")));
        }
        let len = u32::try_from(data.len()).map_err(|_| invalid(format!("{name}: too large")))?;
        entries.push(Entry {
            primary: primary_name(name),
            joliet: ucs2(name),
            extent: next,
            data,
            len,
        });
        next = next
            .checked_add(len.div_ceil(SECTOR as u32))
            .ok_or_else(|| invalid("image too large"))?;
    }
    for (i, a) in entries.iter().enumerate() {
        if entries[..i].iter().any(|b| b.primary == a.primary || b.joliet == a.joliet) {
            return Err(invalid(format!(
                "duplicate file name {}",
                String::from_utf8_lossy(&a.primary)
            )));
        }
    }

    let layout = u64::from(next) * SECTOR as u64;
    let payload: u64 = entries.iter().map(|e| e.data.len() as u64).sum();
    let size = image_size(payload).max(layout);
    let total = u32::try_from(size / SECTOR as u64).map_err(|_| invalid("image too large"))?;

    let mut img = vec![0u8; usize::try_from(layout).map_err(|_| invalid("image too large"))?];

    let mut primary = descriptor(1, label.as_bytes(), b' ', total);
    set_tables(&mut primary, PRIMARY_L_TABLE, PRIMARY_M_TABLE, PRIMARY_ROOT);
    put(&mut img, PRIMARY, &primary);

    let mut joliet = descriptor(2, &ucs2(label), 0, total);
    joliet[88..91].copy_from_slice(b"%/E");
    set_tables(&mut joliet, JOLIET_L_TABLE, JOLIET_M_TABLE, JOLIET_ROOT);
    put(&mut img, JOLIET, &joliet);

    let mut term = [0u8; 7];
    term[0] = 255;
    term[1..6].copy_from_slice(b"CD001");
    term[6] = 1;
    put(&mut img, TERMINATOR, &term);

    put(&mut img, PRIMARY_L_TABLE, &path_table(PRIMARY_ROOT, false));
    put(&mut img, PRIMARY_M_TABLE, &path_table(PRIMARY_ROOT, true));
    put(&mut img, JOLIET_L_TABLE, &path_table(JOLIET_ROOT, false));
    put(&mut img, JOLIET_M_TABLE, &path_table(JOLIET_ROOT, true));

    put(&mut img, PRIMARY_ROOT, &directory(PRIMARY_ROOT, records(&entries, false))?);
    put(&mut img, JOLIET_ROOT, &directory(JOLIET_ROOT, records(&entries, true))?);

    for e in &entries {
        put(&mut img, e.extent, e.data);
    }

    let mut file = fs::File::create(dest)?;
    file.write_all(&img)?;
    file.set_len(size)?;
    file.sync_all()?;
    Ok(size)
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg.into())
}

/// Copies `bytes` to the start of `sector`.
fn put(img: &mut [u8], sector: u32, bytes: &[u8]) {
    let off = sector as usize * SECTOR;
    img[off..off + bytes.len()].copy_from_slice(bytes);
}

/// Volume descriptor with everything but the path table and root locations.
///
/// `pad` fills text fields: ASCII space for the primary descriptor, zero for
/// Joliet (whose UCS-2 identifiers are padded separately).
fn descriptor(kind: u8, volume_id: &[u8], pad: u8, total: u32) -> [u8; SECTOR] {
    let mut d = [0u8; SECTOR];
    d[0] = kind;
    d[1..6].copy_from_slice(b"CD001");
    d[6] = 1;

    let text = |d: &mut [u8; SECTOR], range: std::ops::Range<usize>, value: &[u8]| {
        let field = &mut d[range];
        if pad == 0 {
            // UCS-2 space.
            for pair in field.chunks_mut(2) {
                pair[0] = 0;
                if let Some(low) = pair.get_mut(1) {
                    *low = b' ';
                }
            }
        } else {
            field.fill(pad);
        }
        let n = value.len().min(field.len());
        field[..n].copy_from_slice(&value[..n]);
    };
    let system_id: Vec<u8> = if kind == 1 { b"LINUX".to_vec() } else { ucs2("LINUX") };
    text(&mut d, 8..40, &system_id);
    text(&mut d, 40..72, volume_id);
    both32(&mut d, 80, total);
    both16(&mut d, 120, 1);
    both16(&mut d, 124, 1);
    both16(&mut d, 128, SECTOR as u16);
    both32(&mut d, 132, PATH_TABLE_LEN);
    for range in [190..318, 318..446, 446..574, 574..702, 702..739, 739..776, 776..813] {
        text(&mut d, range, &[]);
    }
    for off in [813, 830, 847, 864] {
        d[off..off + 17].copy_from_slice(&NO_DATE);
    }
    d[881] = 1;
    d
}

/// Fills in path table and root directory locations.
fn set_tables(d: &mut [u8; SECTOR], l_table: u32, m_table: u32, root: u32) {
    d[140..144].copy_from_slice(&l_table.to_le_bytes());
    d[148..152].copy_from_slice(&m_table.to_be_bytes());
    d[156..190].copy_from_slice(&dir_record(&[0], root, SECTOR as u32, FLAG_DIR));
}

/// Path table holding only the root directory.
fn path_table(root: u32, big_endian: bool) -> [u8; PATH_TABLE_LEN as usize] {
    let mut t = [0u8; PATH_TABLE_LEN as usize];
    t[0] = 1;
    if big_endian {
        t[2..6].copy_from_slice(&root.to_be_bytes());
        t[6..8].copy_from_slice(&1u16.to_be_bytes());
    } else {
        t[2..6].copy_from_slice(&root.to_le_bytes());
        t[6..8].copy_from_slice(&1u16.to_le_bytes());
    }
    t
}

/// `(identifier, extent, size)` for each entry in one of the two trees.
fn records<'e>(entries: &'e [Entry<'_>], joliet: bool) -> Vec<(&'e [u8], u32, u32)> {
    entries
        .iter()
        .map(|e| {
            let id = if joliet { &e.joliet } else { &e.primary };
            (id.as_slice(), e.extent, e.len)
        })
        .collect()
}

/// Root directory extent: `.`, `..`, then files sorted by identifier.
///
/// Each file is `(identifier, extent, size)`.
fn directory(own: u32, mut files: Vec<(&[u8], u32, u32)>) -> io::Result<Vec<u8>> {
    files.sort_by(|a, b| a.0.cmp(b.0));

    let mut dir = dir_record(&[0], own, SECTOR as u32, FLAG_DIR);
    dir.extend(dir_record(&[1], own, SECTOR as u32, FLAG_DIR));
    for (id, extent, size) in files {
        dir.extend(dir_record(id, extent, size, 0));
    }
    if dir.len() > SECTOR {
        return Err(invalid("too many files for a single directory sector"));
    }
    Ok(dir)
}

/// Encodes one directory record. Identifiers are at most 128 bytes.
#[allow(clippy::cast_possible_truncation)]
fn dir_record(id: &[u8], extent: u32, size: u32, flags: u8) -> Vec<u8> {
    let len = 33 + id.len() + usize::from(id.len() % 2 == 0);
    let mut r = vec![0u8; len];
    r[0] = len as u8;
    r[32] = id.len() as u8;
    both32(&mut r, 2, extent);
    both32(&mut r, 10, size);
    r[25] = flags;
    both16(&mut r, 28, 1);
    r[33..33 + id.len()].copy_from_slice(id);
    r
}

/// ISO9660 level 2 identifier: `STEM.EXT;1`, upper-case d-characters.
fn primary_name(name: &str) -> Vec<u8> {
    let (stem, ext) = name.rsplit_once('.').unwrap_or((name, ""));
    let clean = |s: &str| -> String {
        s.chars()
            .map(|c| match c.to_ascii_uppercase() {
                c @ ('A'..='Z' | '0'..='9' | '_') => c,
                _ => '_',
            })
            .collect()
    };
    let ext = clean(ext);
    let mut stem = clean(stem);
    stem.truncate(28usize.saturating_sub(ext.len()).max(1));
    format!("{stem}.{ext};1").into_bytes()
}

/// UCS-2 big-endian encoding.
fn ucs2(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_be_bytes).collect()
}

/// Both-endian `u16`: little-endian then big-endian.
#[inline]
fn both16(buf: &mut [u8], offset: usize, val: u16) {
    buf[offset..offset + 2].copy_from_slice(&val.to_le_bytes());
    buf[offset + 2..offset + 4].copy_from_slice(&val.to_be_bytes());
}

/// Both-endian `u32`: little-endian then big-endian.
#[inline]
fn both32(buf: &mut [u8], offset: usize, val: u32) {
    buf[offset..offset + 4].copy_from_slice(&val.to_le_bytes());
    buf[offset + 4..offset + 8].copy_from_slice(&val.to_be_bytes());
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use super::*;

    fn le32(b: &[u8], off: usize) -> u32 {
        u32::from_le_bytes(b[off..off + 4].try_into().unwrap())
    }

    /// Reads the Joliet root directory back as `(name, contents)` pairs.
    pub(crate) fn joliet_files(img: &[u8]) -> Vec<(String, Vec<u8>)> {
        let svd = &img[JOLIET as usize * SECTOR..][..SECTOR];
        assert_eq!(svd[0], 2);
        assert_eq!(&svd[88..91], b"%/E");
        let root = le32(svd, 156 + 2) as usize * SECTOR;

        let mut files = Vec::new();
        let mut off = root;
        while img[off] != 0 {
            let len = img[off] as usize;
            let name_len = img[off + 32] as usize;
            let name = &img[off + 33..off + 33 + name_len];
            if img[off + 25] & FLAG_DIR == 0 {
                let utf16: Vec<u16> = name
                    .chunks(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect();
                let start = le32(img, off + 2) as usize * SECTOR;
                let size = le32(img, off + 10) as usize;
                files.push((
                    String::from_utf16(&utf16).unwrap(),
                    img[start..start + size].to_vec(),
                ));
            }
            off += len;
        }
        files
    }

    /// Primary volume label, trailing padding removed.
    pub(crate) fn volume_label(img: &[u8]) -> String {
        let pvd = &img[PRIMARY as usize * SECTOR..][..SECTOR];
        assert_eq!(pvd[0], 1);
        assert_eq!(&pvd[1..6], b"CD001");
        String::from_utf8_lossy(&pvd[40..72]).trim_end().to_owned()
    }

    fn sample() -> Vec<(String, Vec<u8>)> {
        vec![
            ("user-data".to_owned(), b"#cloud-config\n".to_vec()),
            ("meta-data".to_owned(), b"instance-id: iid-1\n".to_vec()),
            ("network-config".to_owned(), vec![b'x'; 5000]),
        ]
    }

    #[test]
    fn small_payload_gets_minimum_size() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("seed.iso");
        let size = write_image(&dest, "cidata", &sample()).unwrap();
        assert_eq!(size, MIN_IMAGE_SIZE);
        assert_eq!(fs::metadata(&dest).unwrap().len(), MIN_IMAGE_SIZE);
    }

    #[test]
    fn image_size_rules() {
        assert_eq!(image_size(0), MIN_IMAGE_SIZE);
        assert_eq!(image_size(MIN_IMAGE_SIZE - 1), MIN_IMAGE_SIZE);
        assert_eq!(image_size(MIN_IMAGE_SIZE + 1), MIN_IMAGE_SIZE + SECTOR as u64);
    }

    #[test]
    fn large_payload_is_never_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("big.iso");
        let big = vec![7u8; MIN_IMAGE_SIZE as usize];
        let size = write_image(&dest, "cidata", &[("blob".to_owned(), big.clone())]).unwrap();
        assert!(size >= u64::from(FIRST_DATA) * SECTOR as u64 + MIN_IMAGE_SIZE);

        let img = fs::read(&dest).unwrap();
        assert_eq!(joliet_files(&img), vec![("blob".to_owned(), big)]);
    }

    #[test]
    fn joliet_keeps_names_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("seed.iso");
        write_image(&dest, "cidata", &sample()).unwrap();

        let img = fs::read(&dest).unwrap();
        assert_eq!(volume_label(&img), "cidata");
        let files = joliet_files(&img);
        let names: Vec<&str> = files.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["meta-data", "network-config", "user-data"]);
        assert_eq!(files[2].1, b"#cloud-config\n");
        assert_eq!(files[1].1.len(), 5000);
    }

    #[test]
    fn output_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = (dir.path().join("a.iso"), dir.path().join("b.iso"));
        write_image(&a, "cidata", &sample()).unwrap();
        write_image(&b, "cidata", &sample()).unwrap();
        assert_eq!(fs::read(a).unwrap(), fs::read(b).unwrap());
    }

    #[test]
    fn primary_names_are_d_characters() {
        assert_eq!(primary_name("meta-data"), b"META_DATA.;1");
        assert_eq!(primary_name("network-config"), b"NETWORK_CONFIG.;1");
        assert_eq!(primary_name("vendor.data"), b"VENDOR.DATA;1");
    }

    #[test]
    fn rejects_bad_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("x.iso");
        assert!(write_image(&dest, "", &[]).is_err());
        assert!(write_image(&dest, "a-label-that-is-too-long", &[]).is_err());
        let dup = vec![("a-b".to_owned(), vec![]), ("a_b".to_owned(), vec![])];
        assert!(write_image(&dest, "cidata", &dup).is_err());
    }

    #[test]
    fn joliet_name_limit_counts_utf16_units() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("x.iso");

        let astral = "\u{1F600}".repeat(64);
        let err = write_image(&dest, "cidata", &[(astral, vec![1])]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let fits = "\u{1F600}".repeat(32);
        write_image(&dest, "cidata", &[(fits.clone(), vec![1])]).unwrap();
        let img = fs::read(&dest).unwrap();
        assert_eq!(joliet_files(&img), vec![(fits, vec![1])]);
    }

    #[test]
    fn create_from_dir_rejects_subdirectories() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir(src.path().join("nested")).unwrap();
        let err = create_from_dir(src.path(), "cidata", &src.path().join("x.iso")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
