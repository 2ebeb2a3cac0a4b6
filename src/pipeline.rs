//! Driver owning the demuxer → decoder → formatter chain.
//!
//! Reads a transport stream file in 188-byte chunks, keeps the PCR-derived elapsed time
//! clock, locks onto the caption PID announced by the first management group, and feeds
//! decoded statement tokens to the ASS formatter. Decode failures are contained per PES;
//! only I/O failures abort the run.

use crate::arib::decoder::StatementDecoder;
use crate::arib::drcs::DrcsTable;
use crate::arib::{DataGroup, DataGroupPayload, DataUnit};
use crate::ass::AssFormatter;
use crate::{Payload, Pes, Psi, PsiData, TsDemuxer};
use log::{debug, info, warn};
use std::fs::File;
use std::io::{self, BufReader, ErrorKind, Read};
use std::path::PathBuf;
use thiserror::Error;

/// 90 kHz ticks per second of the PCR base clock.
const PCR_HZ: f64 = 90000.0;

/// Fatal application errors; everything recoverable is logged and skipped instead.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("unable to open input {path}: {source}")]
    OpenInput {
        path: PathBuf,
        source: io::Error,
    },
    #[error("i/o error reading transport stream: {0}")]
    Io(#[from] io::Error),
    #[error("unable to write output {path}: {source}")]
    WriteOutput {
        path: PathBuf,
        source: io::Error,
    },
}

/// Pipeline configuration, normally assembled from the CLI.
pub struct Config {
    /// Input transport stream path.
    pub infile: PathBuf,
    /// Output subtitle path.
    pub outfile: PathBuf,
    /// Caption PES PID; `None` auto-detects from the first management group.
    pub pid: Option<u16>,
    /// Subtitle display time limit in seconds.
    pub tmax: u32,
    /// Shift applied to all output times, in seconds.
    pub time_offset: f64,
    /// Suppress stdout diagnostics.
    pub quiet: bool,
}

impl Config {
    /// Configuration with auto-detected PID and default timing.
    pub fn new(infile: PathBuf, outfile: PathBuf) -> Self {
        Self {
            infile,
            outfile,
            pid: None,
            tmax: 5,
            time_offset: 0.0,
            quiet: true,
        }
    }
}

/// What a completed run found.
#[derive(Debug)]
pub struct RunSummary {
    /// The caption PID that was forced or discovered, if any.
    pub caption_pid: Option<u16>,
    /// True when at least one nonempty caption opened the output file.
    pub file_written: bool,
}

enum PesError {
    Parse(crate::Error),
    Io(io::Error),
}

impl From<crate::Error> for PesError {
    fn from(e: crate::Error) -> Self {
        PesError::Parse(e)
    }
}

impl From<io::Error> for PesError {
    fn from(e: io::Error) -> Self {
        PesError::Io(e)
    }
}

struct PipelineContext {
    pid: Option<u16>,
    outfile: PathBuf,
    quiet: bool,
    time_offset: f64,
    initial_pcr: Option<u64>,
    elapsed_time_s: f64,
    candidate_pids: Vec<u16>,
    drcs: DrcsTable,
    formatter: AssFormatter,
}

impl PipelineContext {
    fn new(config: &Config) -> Self {
        Self {
            pid: config.pid,
            outfile: config.outfile.clone(),
            quiet: config.quiet,
            time_offset: config.time_offset,
            initial_pcr: None,
            elapsed_time_s: config.time_offset,
            candidate_pids: Vec::new(),
            drcs: DrcsTable::default(),
            formatter: AssFormatter::to_path(config.tmax, &config.outfile),
        }
    }

    fn on_pcr(&mut self, base: u64) {
        let initial = *self.initial_pcr.get_or_insert(base);
        self.elapsed_time_s = base.saturating_sub(initial) as f64 / PCR_HZ + self.time_offset;
    }

    fn on_psi(&mut self, pid: u16, psi: &Psi) {
        if let PsiData::Pmt(pmt) = &psi.data {
            for caption_pid in pmt.caption_pids() {
                if !self.candidate_pids.contains(&caption_pid) {
                    info!(
                        "PMT on PID {:#06x} announces a caption component on PID {:#06x}",
                        pid, caption_pid
                    );
                    self.candidate_pids.push(caption_pid);
                }
            }
        }
    }

    fn on_pes(&mut self, pid: u16, pes: &Pes) -> Result<(), AppError> {
        if let Some(locked) = self.pid {
            if pid != locked {
                return Ok(());
            }
        }
        match self.handle_caption_pes(pid, pes) {
            Ok(()) => Ok(()),
            Err(PesError::Parse(e)) => {
                debug!("dropping undecodable PES on PID {:#06x}: {:?}", pid, e);
                Ok(())
            }
            Err(PesError::Io(source)) => Err(AppError::WriteOutput {
                path: self.outfile.clone(),
                source,
            }),
        }
    }

    fn handle_caption_pes(&mut self, pid: u16, pes: &Pes) -> Result<(), PesError> {
        let group = DataGroup::from_pes_payload(&pes.data)?;
        match &group.payload {
            DataGroupPayload::Management(management) => {
                if self.pid.is_none() && !management.languages.is_empty() {
                    for language in management.languages.iter() {
                        if !self.quiet {
                            println!(
                                "Closed caption management data for language: {} ({}) available in PID: {}",
                                language.iso_639_language_code,
                                language.display_format(),
                                pid
                            );
                        }
                    }
                    if !self.quiet {
                        println!("Will now only process this PID to improve performance.");
                    }
                    self.pid = Some(pid);
                }
                self.process_data_units(&management.data_units, false)?;
            }
            DataGroupPayload::Statement(statement) => {
                self.process_data_units(&statement.data_units, true)?;
            }
        }
        Ok(())
    }

    fn process_data_units(
        &mut self,
        units: &[DataUnit],
        format_statements: bool,
    ) -> Result<(), PesError> {
        for unit in units {
            match unit {
                DataUnit::Drcs(drcs_unit) => self.drcs.register(drcs_unit),
                DataUnit::StatementBody(body) if format_statements => {
                    // Decoder state intentionally resets per unit; see the decoder docs.
                    let tokens = StatementDecoder::new(&self.drcs).decode(body)?;
                    self.formatter.format(&tokens, self.elapsed_time_s)?;
                }
                DataUnit::StatementBody(_) | DataUnit::Skipped { .. } => {}
            }
        }
        Ok(())
    }
}

/// Reads one packet, treating end of file at any point in the chunk as clean termination.
fn read_packet<R: Read>(reader: &mut R, packet: &mut [u8; 188]) -> io::Result<bool> {
    match reader.read_exact(packet) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Scans forward for the next 0x47 sync byte and refills the packet buffer around it.
fn resync<R: Read>(reader: &mut R, packet: &mut [u8; 188]) -> io::Result<bool> {
    loop {
        if let Some(index) = packet.iter().position(|&b| b == 0x47) {
            if index == 0 {
                return Ok(true);
            }
            packet.copy_within(index.., 0);
            let filled = 188 - index;
            match reader.read_exact(&mut packet[filled..]) {
                Ok(()) => return Ok(true),
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        if !read_packet(reader, packet)? {
            return Ok(false);
        }
    }
}

fn process_stream<R: Read, F: FnMut(u64, u64)>(
    mut reader: R,
    total_bytes: u64,
    ctx: &mut PipelineContext,
    progress: &mut F,
) -> Result<(), AppError> {
    let mut demuxer = TsDemuxer::default();
    let mut packet = [0_u8; 188];
    let mut bytes_read: u64 = 0;

    while read_packet(&mut reader, &mut packet)? {
        bytes_read += 188;
        if packet[0] != 0x47 {
            warn!("lost packet sync near byte {}; rescanning", bytes_read - 188);
            if !resync(&mut reader, &mut packet)? {
                break;
            }
        }
        progress(bytes_read.min(total_bytes), total_bytes);

        match demuxer.parse(&packet) {
            Ok(parsed) => {
                if let Some(adaptation_field) = &parsed.adaptation_field {
                    if let Some(pcr) = adaptation_field.pcr {
                        ctx.on_pcr(pcr.base);
                    }
                }
                match parsed.payload {
                    Some(Payload::Pes(pes)) => ctx.on_pes(parsed.header.pid(), &pes)?,
                    Some(Payload::Psi(psi)) => ctx.on_psi(parsed.header.pid(), &psi),
                    _ => {}
                }
            }
            Err(e) => debug!("dropping packet: {:?}", e),
        }
    }
    Ok(())
}

/// Runs the full extraction pipeline over `config.infile`.
///
/// `progress` is invoked once per packet with `(bytes_read, total_bytes)`.
pub fn run<F: FnMut(u64, u64)>(config: &Config, mut progress: F) -> Result<RunSummary, AppError> {
    let file = File::open(&config.infile).map_err(|source| AppError::OpenInput {
        path: config.infile.clone(),
        source,
    })?;
    let total_bytes = file.metadata()?.len();
    let reader = BufReader::new(file);

    let mut ctx = PipelineContext::new(config);
    process_stream(reader, total_bytes, &mut ctx, &mut progress)?;

    Ok(RunSummary {
        caption_pid: ctx.pid,
        file_written: ctx.formatter.file_written(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arib::tests::{make_statement_pes_payload, make_statement_unit};
    use crate::ass::AssFormatter;
    use crate::tests::{make_packet, make_pes};
    use crate::DATA_GROUP_CRC;
    use std::cell::RefCell;
    use std::io::{Cursor, Write};
    use std::rc::Rc;

    const CAPTION_PID: u16 = 0x0140;

    #[derive(Clone, Default)]
    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl SharedBuf {
        fn contents(&self) -> String {
            String::from_utf8(self.0.borrow().clone()).unwrap()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn memory_context(pid: Option<u16>) -> (PipelineContext, SharedBuf) {
        let buf = SharedBuf::default();
        let sink = buf.clone();
        let ctx = PipelineContext {
            pid,
            outfile: PathBuf::from("test.ass"),
            quiet: true,
            time_offset: 0.0,
            initial_pcr: None,
            elapsed_time_s: 0.0,
            candidate_pids: Vec::new(),
            drcs: DrcsTable::default(),
            formatter: AssFormatter::new(
                5,
                "test.ass".to_string(),
                Box::new(move || Ok(Box::new(sink.clone()) as Box<dyn Write>)),
            ),
        };
        (ctx, buf)
    }

    fn make_pcr_packet(base: u64) -> [u8; 188] {
        let mut packet = [0xFF_u8; 188];
        packet[0] = 0x47;
        packet[1] = 0x01;
        packet[2] = 0x00;
        packet[3] = 0x20;
        packet[4] = 183;
        packet[5] = 0x10;
        packet[6] = (base >> 25) as u8;
        packet[7] = (base >> 17) as u8;
        packet[8] = (base >> 9) as u8;
        packet[9] = (base >> 1) as u8;
        packet[10] = ((base & 1) << 7) as u8;
        packet[11] = 0x00;
        packet
    }

    fn make_management_payload() -> Vec<u8> {
        let mut body = vec![0x00, 0x01, 0b000_0_0000];
        body.extend_from_slice(b"jpn");
        body.push(0x80);
        body.extend_from_slice(&[0x00, 0x00, 0x00]);

        let mut group = vec![0x00, 0x00, 0x00];
        group.extend_from_slice(&(body.len() as u16).to_be_bytes());
        group.extend_from_slice(&body);
        let crc = DATA_GROUP_CRC.checksum(&group);
        group.extend_from_slice(&crc.to_be_bytes());

        let mut payload = vec![0x80, 0xFF, 0xF0];
        payload.extend_from_slice(&group);
        payload
    }

    fn caption_packet(statement_body: &[u8], cc: u8) -> [u8; 188] {
        let payload = make_statement_pes_payload(&make_statement_unit(statement_body));
        make_packet(CAPTION_PID, true, cc, &make_pes(&payload))
    }

    fn run_stream(packets: &[[u8; 188]], pid: Option<u16>) -> (RunSummary, SharedBuf) {
        let mut stream = Vec::new();
        for packet in packets {
            stream.extend_from_slice(packet);
        }
        let total = stream.len() as u64;
        let (mut ctx, buf) = memory_context(pid);
        process_stream(Cursor::new(stream), total, &mut ctx, &mut |_, _| {}).unwrap();
        let summary = RunSummary {
            caption_pid: ctx.pid,
            file_written: ctx.formatter.file_written(),
        };
        (summary, buf)
    }

    #[test]
    fn empty_stream_finds_nothing() {
        let (summary, buf) = run_stream(&[], None);
        assert_eq!(summary.caption_pid, None);
        assert!(!summary.file_written);
        assert!(buf.contents().is_empty());
    }

    #[test]
    fn management_group_locks_pid_and_captions_are_timed() {
        let packets = [
            make_pcr_packet(0),
            make_packet(CAPTION_PID, true, 0, &make_pes(&make_management_payload())),
            caption_packet(&[0x0E, 0x41, 0x42, 0x43], 1),
            make_pcr_packet(90000),
            caption_packet(&[0x0C], 2),
        ];
        let (summary, buf) = run_stream(&packets, None);

        assert_eq!(summary.caption_pid, Some(CAPTION_PID));
        assert!(summary.file_written);
        let contents = buf.contents();
        let dialogues: Vec<&str> = contents
            .lines()
            .filter(|l| l.starts_with("Dialogue:"))
            .collect();
        assert_eq!(dialogues.len(), 1);
        assert!(dialogues[0].starts_with("Dialogue: 0,0:00:00.00,0:00:01.00,normal,"));
        assert!(dialogues[0].contains("ＡＢＣ"));
    }

    #[test]
    fn foreign_pids_are_ignored_once_locked() {
        let other = make_statement_pes_payload(&make_statement_unit(&[0x0E, 0x58]));
        let packets = [
            make_packet(CAPTION_PID, true, 0, &make_pes(&make_management_payload())),
            make_packet(0x0200, true, 0, &make_pes(&other)),
            caption_packet(&[0x0E, 0x41], 1),
            make_pcr_packet(90000),
            caption_packet(&[0x0C], 2),
        ];
        let (summary, buf) = run_stream(&packets, None);
        assert_eq!(summary.caption_pid, Some(CAPTION_PID));
        assert!(buf.contents().contains("Ａ"));
        assert!(!buf.contents().contains("Ｘ"));
    }

    #[test]
    fn undecodable_pes_is_dropped_not_fatal() {
        let mut bad = make_statement_pes_payload(&make_statement_unit(&[0x0E, 0x41]));
        bad[0] = 0x00; // break the PES data prefix
        let packets = [
            make_packet(CAPTION_PID, true, 0, &make_pes(&bad)),
            caption_packet(&[0x0E, 0x42], 1),
            make_pcr_packet(90000),
            caption_packet(&[0x0C], 2),
        ];
        let (summary, buf) = run_stream(&packets, Some(CAPTION_PID));
        assert_eq!(summary.caption_pid, Some(CAPTION_PID));
        assert!(buf.contents().contains("Ｂ"));
        assert!(!buf.contents().contains("Ａ"));
    }

    #[test]
    fn resync_skips_leading_garbage() {
        let packets = [
            make_packet(CAPTION_PID, true, 0, &make_pes(&make_management_payload())),
            caption_packet(&[0x0E, 0x41], 1),
            make_pcr_packet(90000),
            caption_packet(&[0x0C], 2),
        ];
        let mut stream = vec![0x00, 0x01, 0x02];
        for packet in &packets {
            stream.extend_from_slice(packet);
        }
        let total = stream.len() as u64;
        let (mut ctx, buf) = memory_context(None);
        process_stream(Cursor::new(stream), total, &mut ctx, &mut |_, _| {}).unwrap();
        assert_eq!(ctx.pid, Some(CAPTION_PID));
        assert!(buf.contents().contains("Ａ"));
    }

    #[test]
    fn elapsed_time_tracks_pcr_deltas() {
        let packets = [
            make_pcr_packet(900000),
            make_pcr_packet(900000 + 45000),
        ];
        let mut stream = Vec::new();
        for packet in &packets {
            stream.extend_from_slice(packet);
        }
        let (mut ctx, _) = memory_context(None);
        process_stream(Cursor::new(stream), 376, &mut ctx, &mut |_, _| {}).unwrap();
        assert_eq!(ctx.initial_pcr, Some(900000));
        assert!((ctx.elapsed_time_s - 0.5).abs() < 1e-9);
    }

    #[test]
    fn progress_reports_monotonic_byte_counts() {
        let packets = [make_pcr_packet(0), make_pcr_packet(90000)];
        let mut stream = Vec::new();
        for packet in &packets {
            stream.extend_from_slice(packet);
        }
        let total = stream.len() as u64;
        let (mut ctx, _) = memory_context(None);
        let mut seen = Vec::new();
        process_stream(Cursor::new(stream), total, &mut ctx, &mut |read, total| {
            seen.push((read, total))
        })
        .unwrap();
        assert_eq!(seen, [(188, 376), (376, 376)]);
    }
}
