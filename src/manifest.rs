use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Environment contract with the interposer. The names are fixed; the child
/// side hard-codes them.
pub const ENV_MANIFEST_PATH: &str = "__BUILDXL_FAM_PATH";
pub const ENV_INTERPOSER_PATH: &str = "__BUILDXL_DETOURS_PATH";
pub const ENV_ROOT_PID: &str = "__BUILDXL_ROOT_PID";
pub const ENV_DEBUG_LOG_PATH: &str = "__BUILDXL_LOG_PATH";
pub const ENV_LD_PRELOAD: &str = "LD_PRELOAD";

pub const MANIFEST_VERSION: u32 = 1;

bitflags! {
    /// Per-scope policy bits consulted by the interposer for each syscall.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ScopeFlags: u32 {
        const ALLOW_READ = 1 << 0;
        const ALLOW_WRITE = 1 << 1;
        const ALLOW_PROBE = 1 << 2;
        const REPORT_ACCESS = 1 << 3;
        const FAKE_INPUT_TIMESTAMPS = 1 << 4;
        const ALLOW_SYMLINK_CREATION = 1 << 5;
        const ALLOW_CREATE_DIRECTORY = 1 << 6;
        const MASK_NOTHING = 1 << 7;
        const MASK_ALL = 1 << 8;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ManifestFlags: u32 {
        const MONITOR_CHILD_PROCESSES = 1 << 0;
        const REPORT_FILE_ACCESSES = 1 << 1;
        const REPORT_PROCESS_ARGS = 1 << 2;
        const FAIL_UNEXPECTED = 1 << 3;
        const BREAK_ON_UNEXPECTED = 1 << 4;
        const ENFORCE_POLICIES_ON_MKDIR = 1 << 5;
        const CHECK_MESSAGE_COUNT = 1 << 6;
    }
}

// scope flags travel as raw bits in task-descriptor files
impl Serialize for ScopeFlags {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ScopeFlags {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u32::deserialize(deserializer).map(Self::from_bits_truncate)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopePolicy {
    pub prefix: PathBuf,
    pub flags: ScopeFlags,
}

/// The file-access policy blob the child reads on startup.
///
/// The leading debug byte must match the interposer build; the child bails
/// out on mismatch, which surfaces as a detouring failure.
pub struct Manifest {
    pub task_id: u64,
    pub debug: bool,
    pub flags: ManifestFlags,
    pub report_path: PathBuf,
    pub scopes: Vec<ScopePolicy>,
}

fn write_path(w: &mut impl Write, path: &Path) -> io::Result<()> {
    let bytes = path.as_os_str().as_bytes();
    w.write_all(&(bytes.len() as u32).to_le_bytes())?;
    w.write_all(bytes)
}

impl Manifest {
    pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_all(&[self.debug as u8])?;
        w.write_all(&MANIFEST_VERSION.to_le_bytes())?;
        w.write_all(&self.task_id.to_le_bytes())?;
        w.write_all(&self.flags.bits().to_le_bytes())?;
        write_path(w, &self.report_path)?;
        w.write_all(&(self.scopes.len() as u32).to_le_bytes())?;
        for scope in &self.scopes {
            w.write_all(&scope.flags.bits().to_le_bytes())?;
            write_path(w, &scope.prefix)?;
        }
        Ok(())
    }

    pub fn write_file(&self, path: &Path) -> io::Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        self.write_to(&mut out)?;
        out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_u32(buf: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
    }

    #[test]
    fn layout_is_stable() {
        let manifest = Manifest {
            task_id: 0xdead_beef,
            debug: true,
            flags: ManifestFlags::MONITOR_CHILD_PROCESSES | ManifestFlags::REPORT_FILE_ACCESSES,
            report_path: PathBuf::from("/tmp/bxl_x.fifo"),
            scopes: vec![ScopePolicy {
                prefix: PathBuf::from("/w"),
                flags: ScopeFlags::ALLOW_WRITE | ScopeFlags::REPORT_ACCESS,
            }],
        };

        let mut buf = Vec::new();
        manifest.write_to(&mut buf).unwrap();

        assert_eq!(buf[0], 1);
        assert_eq!(read_u32(&buf, 1), MANIFEST_VERSION);
        assert_eq!(
            u64::from_le_bytes(buf[5..13].try_into().unwrap()),
            0xdead_beef
        );
        assert_eq!(read_u32(&buf, 13), manifest.flags.bits());
        let path_len = read_u32(&buf, 17) as usize;
        assert_eq!(&buf[21..21 + path_len], b"/tmp/bxl_x.fifo");
        let scopes_at = 21 + path_len;
        assert_eq!(read_u32(&buf, scopes_at), 1);
        assert_eq!(
            read_u32(&buf, scopes_at + 4),
            (ScopeFlags::ALLOW_WRITE | ScopeFlags::REPORT_ACCESS).bits()
        );
    }

    #[test]
    fn debug_byte_reflects_mode() {
        let mut manifest = Manifest {
            task_id: 1,
            debug: false,
            flags: ManifestFlags::empty(),
            report_path: PathBuf::from("/tmp/r"),
            scopes: vec![],
        };
        let mut buf = Vec::new();
        manifest.write_to(&mut buf).unwrap();
        assert_eq!(buf[0], 0);

        manifest.debug = true;
        buf.clear();
        manifest.write_to(&mut buf).unwrap();
        assert_eq!(buf[0], 1);
    }
}
