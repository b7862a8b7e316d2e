use std::io::{self, Read};
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, trace, warn};

use crate::error::WardenError;
use crate::fifo::{PipeId, ReportPipe};
use crate::report::{
    decode_record, Decoded, Report, END_OF_REPORTS_SENTINEL, MAX_RECORD_LEN,
    NO_ACTIVE_PROCESSES_SENTINEL,
};

#[derive(Debug)]
pub enum CloseReason {
    EndOfReports,
    Eof,
    Failed(WardenError),
}

#[derive(Debug)]
pub struct PipeEvent {
    pub pipe: PipeId,
    pub kind: PipeEventKind,
}

#[derive(Debug)]
pub enum PipeEventKind {
    Report(Report),
    NoActiveProcesses,
    Closed(CloseReason),
}

enum ReadStep {
    Record(String),
    NoActiveProcesses,
    EndOfReports,
    Eof,
}

/// Read one length-prefixed frame. A zero-byte read on the very first prefix
/// byte is EOF; anywhere else it is a truncated frame and fatal.
fn read_step(r: &mut impl Read) -> Result<ReadStep, WardenError> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        match r.read(&mut len_buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(ReadStep::Eof),
            Ok(0) => return Err(WardenError::protocol("short read in length prefix")),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(WardenError::Pipe(e)),
        }
    }

    let len = i32::from_le_bytes(len_buf);
    match len {
        NO_ACTIVE_PROCESSES_SENTINEL => return Ok(ReadStep::NoActiveProcesses),
        END_OF_REPORTS_SENTINEL => return Ok(ReadStep::EndOfReports),
        l if l <= 0 || l > MAX_RECORD_LEN => {
            return Err(WardenError::protocol(format!("invalid record length {}", l)))
        }
        _ => {}
    }

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            WardenError::protocol("short read in record payload")
        } else {
            WardenError::Pipe(e)
        }
    })?;
    let text = String::from_utf8(payload)
        .map_err(|_| WardenError::protocol("record payload is not UTF-8"))?;
    Ok(ReadStep::Record(text))
}

/// Blocking loop over one FIFO. Posts events to the dispatcher in arrival
/// order and always finishes with a `Closed` notice.
pub fn run_reader(pipe: Arc<ReportPipe>, tx: UnboundedSender<PipeEvent>) {
    let id = pipe.id();
    let send = |kind: PipeEventKind| tx.send(PipeEvent { pipe: id, kind }).is_ok();

    let Some(mut read) = pipe.take_read() else {
        error!(pipe = ?id, "read end already taken");
        send(PipeEventKind::Closed(CloseReason::Failed(
            WardenError::protocol("read end already taken"),
        )));
        return;
    };

    let reason = loop {
        match read_step(&mut read) {
            Ok(ReadStep::Record(payload)) => match decode_record(&payload) {
                Ok(Decoded::Report(report)) => {
                    if !send(PipeEventKind::Report(report)) {
                        // dispatcher is gone; nothing left to deliver to
                        break CloseReason::Eof;
                    }
                }
                Ok(Decoded::Skip(why)) => {
                    warn!(pipe = ?id, %why, %payload, "dropped record");
                }
                Err(err) => {
                    error!(pipe = ?id, %err, %payload, "malformed record");
                    break CloseReason::Failed(err);
                }
            },
            Ok(ReadStep::NoActiveProcesses) => {
                trace!(pipe = ?id, "no-active-processes marker");
                if !send(PipeEventKind::NoActiveProcesses) {
                    break CloseReason::Eof;
                }
            }
            Ok(ReadStep::EndOfReports) => {
                debug!(pipe = ?id, "end of reports");
                break CloseReason::EndOfReports;
            }
            Ok(ReadStep::Eof) => {
                debug!(pipe = ?id, "eof");
                break CloseReason::Eof;
            }
            Err(err) => {
                error!(pipe = ?id, %err, "report read failed");
                break CloseReason::Failed(err);
            }
        }
    };

    pipe.retire_read(read);
    send(PipeEventKind::Closed(reason));
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::report::Operation;

    fn frame(payload: &str) -> Vec<u8> {
        let mut out = (payload.len() as i32).to_le_bytes().to_vec();
        out.extend_from_slice(payload.as_bytes());
        out
    }

    fn sentinel(value: i32) -> Vec<u8> {
        value.to_le_bytes().to_vec()
    }

    #[test]
    fn steps_through_records_and_sentinels() {
        let mut stream = Vec::new();
        stream.extend(frame("0|open|12|42|1|0|1|0|0|0|/etc/hosts"));
        stream.extend(sentinel(NO_ACTIVE_PROCESSES_SENTINEL));
        stream.extend(sentinel(END_OF_REPORTS_SENTINEL));
        let mut cursor = Cursor::new(stream);

        match read_step(&mut cursor).unwrap() {
            ReadStep::Record(payload) => assert!(payload.starts_with("0|open")),
            _ => panic!("expected record"),
        }
        assert!(matches!(
            read_step(&mut cursor).unwrap(),
            ReadStep::NoActiveProcesses
        ));
        assert!(matches!(
            read_step(&mut cursor).unwrap(),
            ReadStep::EndOfReports
        ));
        assert!(matches!(read_step(&mut cursor).unwrap(), ReadStep::Eof));
    }

    #[test]
    fn unknown_negative_length_is_fatal() {
        let mut cursor = Cursor::new(sentinel(-5));
        assert!(matches!(
            read_step(&mut cursor),
            Err(WardenError::Protocol(_))
        ));
    }

    #[test]
    fn truncated_prefix_is_fatal() {
        let mut cursor = Cursor::new(vec![0x10, 0x00]);
        assert!(matches!(
            read_step(&mut cursor),
            Err(WardenError::Protocol(_))
        ));
    }

    #[test]
    fn truncated_payload_is_fatal() {
        let mut bytes = (100i32).to_le_bytes().to_vec();
        bytes.extend_from_slice(b"only a little");
        let mut cursor = Cursor::new(bytes);
        assert!(matches!(
            read_step(&mut cursor),
            Err(WardenError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn reader_loop_over_a_real_fifo() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let pipe = Arc::new(
            crate::fifo::ReportPipe::create(dir.path().join("bxl_t.fifo"), PipeId::Primary)
                .unwrap(),
        );
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let writer_path = pipe.path().to_path_buf();
        let writer = std::thread::spawn(move || {
            let mut w = std::fs::OpenOptions::new()
                .write(true)
                .open(writer_path)
                .unwrap();
            w.write_all(&frame("0|open|13|7|1|0|2|0|0|0|/w/out")).unwrap();
            w.write_all(&sentinel(END_OF_REPORTS_SENTINEL)).unwrap();
        });

        let reader_pipe = pipe.clone();
        let reader = tokio::task::spawn_blocking(move || run_reader(reader_pipe, tx));

        let first = rx.recv().await.unwrap();
        match first.kind {
            PipeEventKind::Report(Report::FileAccess(a)) => {
                assert_eq!(a.operation, Operation::Write);
                assert_eq!(a.pid, 7);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        let second = rx.recv().await.unwrap();
        assert!(matches!(
            second.kind,
            PipeEventKind::Closed(CloseReason::EndOfReports)
        ));
        assert!(rx.recv().await.is_none());

        writer.join().unwrap();
        reader.await.unwrap();
    }
}
