use bitflags::bitflags;

use crate::error::WardenError;

/// Length-prefix control values. Anything else negative is a protocol error.
pub const NO_ACTIVE_PROCESSES_SENTINEL: i32 = -21;
pub const END_OF_REPORTS_SENTINEL: i32 = -22;

/// Upper bound on a single record payload. The interposer emits one line per
/// syscall; anything bigger than this is a corrupt length prefix.
pub const MAX_RECORD_LEN: i32 = 16 * 1024 * 1024;

const REPORT_TYPE_FILE_ACCESS: u32 = 0;
const REPORT_TYPE_DEBUG: u32 = 1;

/// Operations reported by the interposer, with their wire values.
///
/// Source and destination variants of rename/link are distinct so downstream
/// accounting can pair them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Operation {
    // process lifecycle
    Process = 0,
    ProcessExec = 1,
    ProcessExit = 2,
    ProcessBreakaway = 3,
    ProcessTreeCompletedAck = 4,
    ProcessRequiresPtrace = 5,
    // file accesses
    Open = 10,
    Create = 11,
    Read = 12,
    Write = 13,
    Probe = 14,
    Enumerate = 15,
    RenameSource = 16,
    RenameDest = 17,
    Delete = 18,
    CreateDir = 19,
    RemoveDir = 20,
    Readlink = 21,
    Stat = 22,
    SymlinkSource = 23,
    HardlinkSource = 24,
    HardlinkDest = 25,
}

impl Operation {
    pub fn from_wire(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::Process,
            1 => Self::ProcessExec,
            2 => Self::ProcessExit,
            3 => Self::ProcessBreakaway,
            4 => Self::ProcessTreeCompletedAck,
            5 => Self::ProcessRequiresPtrace,
            10 => Self::Open,
            11 => Self::Create,
            12 => Self::Read,
            13 => Self::Write,
            14 => Self::Probe,
            15 => Self::Enumerate,
            16 => Self::RenameSource,
            17 => Self::RenameDest,
            18 => Self::Delete,
            19 => Self::CreateDir,
            20 => Self::RemoveDir,
            21 => Self::Readlink,
            22 => Self::Stat,
            23 => Self::SymlinkSource,
            24 => Self::HardlinkSource,
            25 => Self::HardlinkDest,
            _ => return None,
        })
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const PROBE = 1 << 2;
        const ENUMERATE = 1 << 3;
    }
}

impl AccessFlags {
    /// Access closure: a Read implies a Probe, a Write implies Read and
    /// Probe. Used for cache admission so a later weaker access on the same
    /// path is a hit.
    pub fn closure(self) -> Self {
        let mut out = self;
        if self.contains(Self::WRITE) {
            out |= Self::READ | Self::PROBE;
        }
        if self.contains(Self::READ) {
            out |= Self::PROBE;
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAccessStatus {
    Allowed,
    Denied,
    CannotDeterminePolicy,
}

impl FileAccessStatus {
    fn from_wire(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::Allowed,
            1 => Self::Denied,
            2 => Self::CannotDeterminePolicy,
            _ => return None,
        })
    }
}

/// One decoded file-access (or process-lifecycle) record. Immutable once
/// parsed.
#[derive(Debug, Clone)]
pub struct ReportedAccess {
    pub syscall: String,
    pub operation: Operation,
    pub pid: u32,
    pub ppid: u32,
    pub errno: u32,
    pub requested: AccessFlags,
    pub status: FileAccessStatus,
    pub explicit: bool,
    pub is_directory: bool,
    pub path: String,
    pub cmdline: Option<String>,
}

impl ReportedAccess {
    /// Existence probing only: the access asked for nothing beyond a probe.
    pub fn is_existence_based(&self) -> bool {
        self.requested.contains(AccessFlags::PROBE)
            && (AccessFlags::PROBE | AccessFlags::ENUMERATE).contains(self.requested)
    }
}

#[derive(Debug)]
pub enum Report {
    FileAccess(ReportedAccess),
    Debug { pid: u32, text: String },
}

/// Outcome of decoding one record payload. `Skip` covers fields that parse
/// but name an unknown vocabulary value; the record is logged and dropped
/// without killing the channel.
pub enum Decoded {
    Report(Report),
    Skip(String),
}

fn parse_u32(field: &str, what: &str) -> Result<u32, WardenError> {
    field
        .parse::<u32>()
        .map_err(|_| WardenError::protocol(format!("unparsable {}: {:?}", what, field)))
}

fn parse_bool(field: &str, what: &str) -> Result<bool, WardenError> {
    match field {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(WardenError::protocol(format!(
            "unparsable {}: {:?}",
            what, field
        ))),
    }
}

/// Decode one `|`-separated record.
///
/// Frame: `0|syscall|op|pid|ppid|errno|access|status|explicit|isdir|path[|cmdline]`
/// or `1|pid|text`.
pub fn decode_record(payload: &str) -> Result<Decoded, WardenError> {
    let payload = payload.strip_suffix('\n').unwrap_or(payload);
    let (kind, rest) = payload
        .split_once('|')
        .ok_or_else(|| WardenError::protocol("record with no field separator"))?;

    match parse_u32(kind, "report type")? {
        REPORT_TYPE_FILE_ACCESS => decode_file_access(rest),
        REPORT_TYPE_DEBUG => {
            let (pid, text) = rest
                .split_once('|')
                .ok_or_else(|| WardenError::protocol("debug record with wrong field count"))?;
            Ok(Decoded::Report(Report::Debug {
                pid: parse_u32(pid, "pid")?,
                text: text.to_string(),
            }))
        }
        other => Ok(Decoded::Skip(format!("unknown report type {}", other))),
    }
}

fn decode_file_access(rest: &str) -> Result<Decoded, WardenError> {
    // path is field 10, cmdline is an optional trailing remainder
    let fields: Vec<&str> = rest.splitn(11, '|').collect();
    if fields.len() < 10 {
        return Err(WardenError::protocol(format!(
            "file access record with {} fields",
            fields.len() + 1
        )));
    }

    let op_raw = parse_u32(fields[1], "operation")?;
    let operation = match Operation::from_wire(op_raw) {
        Some(op) => op,
        None => return Ok(Decoded::Skip(format!("unknown operation {}", op_raw))),
    };

    let access_raw = parse_u32(fields[5], "requested access")?;
    let requested = match AccessFlags::from_bits(access_raw) {
        Some(f) => f,
        None => return Ok(Decoded::Skip(format!("unknown access bits {:#x}", access_raw))),
    };

    let status_raw = parse_u32(fields[6], "status")?;
    let status = match FileAccessStatus::from_wire(status_raw) {
        Some(s) => s,
        None => return Ok(Decoded::Skip(format!("unknown status {}", status_raw))),
    };

    Ok(Decoded::Report(Report::FileAccess(ReportedAccess {
        syscall: fields[0].to_string(),
        operation,
        pid: parse_u32(fields[2], "pid")?,
        ppid: parse_u32(fields[3], "ppid")?,
        errno: parse_u32(fields[4], "errno")?,
        requested,
        status,
        explicit: parse_bool(fields[7], "explicit flag")?,
        is_directory: parse_bool(fields[8], "directory flag")?,
        path: fields[9].to_string(),
        cmdline: fields.get(10).map(|s| s.to_string()),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_access(payload: &str) -> ReportedAccess {
        match decode_record(payload).unwrap() {
            Decoded::Report(Report::FileAccess(a)) => a,
            other => panic!("expected file access, got {:?}", discriminant_name(&other)),
        }
    }

    fn discriminant_name(d: &Decoded) -> &'static str {
        match d {
            Decoded::Report(Report::FileAccess(_)) => "FileAccess",
            Decoded::Report(Report::Debug { .. }) => "Debug",
            Decoded::Skip(_) => "Skip",
        }
    }

    #[test]
    fn decodes_file_access() {
        let a = decode_access("0|open|13|42|1|0|2|0|0|0|/w/out1\n");
        assert_eq!(a.operation, Operation::Write);
        assert_eq!(a.pid, 42);
        assert_eq!(a.ppid, 1);
        assert_eq!(a.requested, AccessFlags::WRITE);
        assert_eq!(a.status, FileAccessStatus::Allowed);
        assert_eq!(a.path, "/w/out1");
        assert!(a.cmdline.is_none());
    }

    #[test]
    fn decodes_cmdline_tail() {
        let a = decode_access("0|execve|1|42|1|0|1|0|1|0|/bin/cat|cat /etc/hosts");
        assert_eq!(a.operation, Operation::ProcessExec);
        assert_eq!(a.path, "/bin/cat");
        assert_eq!(a.cmdline.as_deref(), Some("cat /etc/hosts"));
    }

    #[test]
    fn decodes_debug_record() {
        match decode_record("1|7|hello|world").unwrap() {
            Decoded::Report(Report::Debug { pid, text }) => {
                assert_eq!(pid, 7);
                assert_eq!(text, "hello|world");
            }
            _ => panic!("expected debug record"),
        }
    }

    #[test]
    fn wrong_field_count_is_fatal() {
        assert!(decode_record("0|open|13|42").is_err());
        assert!(decode_record("nonsense").is_err());
    }

    #[test]
    fn bad_integer_is_fatal() {
        assert!(decode_record("0|open|13|notapid|1|0|2|0|0|0|/x").is_err());
    }

    #[test]
    fn unknown_vocabulary_is_skipped() {
        assert!(matches!(
            decode_record("0|open|999|42|1|0|2|0|0|0|/x").unwrap(),
            Decoded::Skip(_)
        ));
        assert!(matches!(
            decode_record("0|open|13|42|1|0|4096|0|0|0|/x").unwrap(),
            Decoded::Skip(_)
        ));
    }

    #[test]
    fn access_closure() {
        assert_eq!(
            AccessFlags::WRITE.closure(),
            AccessFlags::WRITE | AccessFlags::READ | AccessFlags::PROBE
        );
        assert_eq!(
            AccessFlags::READ.closure(),
            AccessFlags::READ | AccessFlags::PROBE
        );
        assert_eq!(AccessFlags::PROBE.closure(), AccessFlags::PROBE);
        assert_eq!(AccessFlags::ENUMERATE.closure(), AccessFlags::ENUMERATE);
    }

    #[test]
    fn existence_based_accesses() {
        let mut a = decode_access("0|stat|22|42|1|2|4|1|0|0|/missing");
        assert!(a.is_existence_based());
        a.requested = AccessFlags::READ;
        assert!(!a.is_existence_based());
        a.requested = AccessFlags::PROBE | AccessFlags::ENUMERATE;
        assert!(a.is_existence_based());
    }
}
