//! Extract ARIB STD-B24 closed captions from MPEG transport streams.
//!
//! The crate is organized as a small synchronous pipeline: [`TsDemuxer`] parses 188-byte
//! transport stream packets and reassembles PES payload units, the [`arib`] module parses the
//! caption data group hierarchy carried in those payloads into tokens, and the [`ass`] module
//! formats the tokens into timed `.ass` dialogue events. The [`pipeline`] module owns the whole
//! chain and drives it from a file.
//!
//! # Usage
//!
//! ```no_run
//! use ts2ass::pipeline::{run, Config};
//!
//! let config = Config::new("recording.ts".into(), "recording.ts.ass".into());
//! let summary = run(&config, |_read, _total| {}).expect("i/o error");
//! assert!(summary.file_written);
//! ```

#![deny(unsafe_code)]

use crc::{Crc, Digest, CRC_16_IBM_3740, CRC_32_MPEG_2};
use log::warn;
use modular_bitfield_msb::prelude::*;
use std::collections::{HashMap, HashSet};
use std::fmt::{Debug, Formatter};
use std::result;

mod slice_reader;
pub use slice_reader::SliceReader;

mod payload_unit;
use payload_unit::PayloadUnitBuilder;

mod psi;
pub use psi::{
    Descriptor, ElementaryStreamInfo, ElementaryStreamInfoHeader, PatEntry, Pmt, PmtHeader, Psi,
    PsiData, PsiHeader, PsiTableSyntax,
};

mod pes;
pub use pes::{Pes, PesHeader, PesOptionalHeader};

pub mod arib;
pub mod ass;
pub mod pipeline;

const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);
type CrcDigest = Digest<'static, u32>;

/// CRC-16 used by the ARIB data group trailer.
pub(crate) const DATA_GROUP_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Errors that may be encountered while parsing a transport stream or the caption structures
/// carried within it.
#[derive(Debug)]
pub enum ErrorDetails {
    /// Encountered when a [`SliceReader`] reads out of bounds.
    /// The [`usize`] parameter is the length of the offending read.
    PacketOverrun(usize),
    /// MPEG-TS packet headers must contain a sync byte of 0x47.
    /// This is the error when encountering any other value.
    LostSync,
    /// Encountered for inconsistent [`AdaptationFieldHeader`] parses.
    BadAdaptationHeader,
    /// Encountered for inconsistent [`PsiHeader`] parses.
    BadPsiHeader,
    /// Encountered when a PSI unit fails CRC check.
    PsiCrcMismatch,
    /// Encountered for inconsistent [`PesHeader`] or [`PesOptionalHeader`] parses.
    BadPesHeader,
    /// Synchronized PES data must lead with a 0x80/0x81 data identifier.
    BadSyncPesHeader,
    /// Encountered for inconsistent caption data group parses.
    BadDataGroup,
    /// A data unit did not start with the 0x1F unit separator.
    /// The [`u8`] parameter is the byte found in its place.
    MalformedUnit(u8),
    /// A DRCS font record used a transmission mode other than two-tone uncompressed.
    UnsupportedDrcsMode(u8),
    /// An escape sequence in a caption statement did not form a valid designation.
    BadEscapeSequence,
}

/// Error type encapsulating all possible parser errors.
#[derive(Debug)]
pub struct Error {
    /// Byte index within the packet that the error was encountered.
    pub location: usize,
    /// Information about the error.
    pub details: ErrorDetails,
}

impl Error {
    pub(crate) fn new(location: usize, details: ErrorDetails) -> Self {
        Self { location, details }
    }
}

/// [`std::result::Result`] alias that uses [`Error`].
pub type Result<T> = result::Result<T, Error>;

/// TSC information used in a packet's payload.
#[repr(u8)]
#[derive(Debug, BitfieldSpecifier)]
#[bits = 2]
pub enum TransportScramblingControl {
    /// Not scrambled.
    NotScrambled,
    /// Do not use.
    Reserved,
    /// Scrambled with even key.
    ScrambledEvenKey,
    /// Scrambled with odd key.
    ScrambledOddKey,
}

/// Link-layer header found at the start of every 188-byte MPEG-TS packet.
#[bitfield]
#[derive(Debug)]
pub struct PacketHeader {
    pub sync_byte: B8,
    pub tei: bool,
    pub pusi: bool,
    pub priority: bool,
    pub pid: B13,
    pub tsc: TransportScramblingControl,
    pub has_adaptation_field: bool,
    pub has_payload: bool,
    pub continuity_counter: B4,
}

/// Packets may contain adaptation meta data in addition or in lieu of payload data. This header
/// specifies the particular type(s) of meta-data contained.
#[bitfield]
#[derive(Debug)]
pub struct AdaptationFieldHeader {
    pub length: B8,
    pub discontinuity: bool,
    pub random_access: bool,
    pub priority: bool,
    pub has_pcr: bool,
    pub has_opcr: bool,
    pub has_splice_countdown: bool,
    pub has_transport_private_data: bool,
    pub has_adaptation_field_extension: bool,
}

/// Expands to [`format_args`] for a 90kHz timestamp of any integer type.
///
/// Format is <hours>:<minutes>:<seconds>:<90kHz-ticks>
///
/// # Example
///
/// ```
/// use ts2ass::pts_format_args;
/// assert_eq!(std::fmt::format(pts_format_args!(900000)), "0:0:10:0");
/// ```
#[macro_export]
macro_rules! pts_format_args {
    ($pts:expr) => {
        format_args!(
            "{}:{}:{}:{}",
            $pts / (90000 * 60 * 60),
            $pts / (90000 * 60) % 60,
            $pts / 90000 % 60,
            $pts % 90000
        )
    };
}

/// Program clock reference (PCR) for synchronizing the decoder with the encoder.
///
/// Periodically sent for every program contained in the transport stream.
#[derive(Default, Copy, Clone)]
pub struct PcrTimestamp {
    /// 33-bits of a 90kHz base clock. May be formatted with [`pts_format_args`].
    pub base: u64,
    /// 9-bits of a 27MHz clock rolling over every 300 counts to the base.
    pub extension: u16,
}

impl Debug for PcrTimestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcrTimestamp")
            .field("base", &pts_format_args!(self.base))
            .field("extension", &self.extension)
            .finish()
    }
}

/// Non-payload packet metadata.
#[derive(Debug)]
pub struct AdaptationField {
    /// Header describing which fields are contained.
    pub header: AdaptationFieldHeader,
    /// Program Clock Reference.
    pub pcr: Option<PcrTimestamp>,
    /// Original Program Clock Reference.
    pub opcr: Option<PcrTimestamp>,
}

/// Parsed payload of the packet.
///
/// If the packet is part of an incomplete payload unit, the appropriate pending variant is set.
#[derive(Debug)]
pub enum Payload<'a> {
    /// Unhandled payload type; parsing is left to the application.
    Raw(SliceReader<'a>),
    /// PSI payload unit is incomplete.
    PsiPending,
    /// Complete parsed PSI payload.
    Psi(Psi),
    /// PES payload unit is incomplete.
    PesPending,
    /// Complete reassembled PES payload.
    Pes(Pes),
    /// Continuation of a unit this parser never saw the start of.
    Unknown,
}

/// Top-level parsed structure for one MPEG-TS packet.
#[derive(Debug)]
pub struct Packet<'a> {
    /// Packet link-layer header.
    pub header: PacketHeader,
    /// Optional adaptation field metadata.
    pub adaptation_field: Option<AdaptationField>,
    /// Optional payload data.
    pub payload: Option<Payload<'a>>,
}

/// MPEG-TS parser state capable of assembling payload units.
///
/// # Example
///
/// ```no_run
/// use ts2ass::TsDemuxer;
/// use std::fs::File;
/// use std::io::Read;
///
/// let mut file = File::open("recording.ts").expect("Unable to open!");
/// let mut demuxer = TsDemuxer::default();
/// let mut packet = [0_u8; 188];
/// while file.read_exact(&mut packet).is_ok() {
///     let parsed_packet = demuxer.parse(&packet).expect("Parse Error!");
///     println!("{:?}", parsed_packet);
/// }
/// ```
pub struct TsDemuxer {
    pending_payload_units: HashMap<u16, PayloadUnitBuilder>,
    known_pmt_pids: HashSet<u16>,
    nit_pid: u16,
}

impl Default for TsDemuxer {
    fn default() -> Self {
        Self {
            pending_payload_units: HashMap::new(),
            known_pmt_pids: HashSet::new(),
            nit_pid: 0x0010,
        }
    }
}

fn is_pes(b: &[u8; 3]) -> bool {
    b[0] == 0 && b[1] == 0 && b[2] == 1
}

fn parse_timestamp(b: &[u8; 5]) -> u64 {
    let mut ts: u64 = ((b[0] & 0x0E) as u64) << 29;
    ts |= (b[1] as u64) << 22;
    ts |= ((b[2] & 0xFE) as u64) << 14;
    ts |= (b[3] as u64) << 7;
    ts |= ((b[4] & 0xFE) as u64) >> 1;
    ts
}

fn parse_pcr(b: &[u8; 6]) -> PcrTimestamp {
    let mut base: u64 = (b[0] as u64) << 25;
    base |= (b[1] as u64) << 17;
    base |= (b[2] as u64) << 9;
    base |= (b[3] as u64) << 1;
    base |= (b[4] as u64) >> 7;

    let mut extension: u16 = ((b[4] & 0x1) as u16) << 8;
    extension |= b[5] as u16;
    PcrTimestamp { base, extension }
}

impl TsDemuxer {
    fn read_adaptation_field(&mut self, reader: &mut SliceReader) -> Result<AdaptationField> {
        let mut out = AdaptationField {
            header: read_bitfield!(reader, AdaptationFieldHeader),
            pcr: None,
            opcr: None,
        };
        let adaptation_field_length = out.header.length() as usize;
        if !(1..=183).contains(&adaptation_field_length) {
            warn!("Bad adaptation field length");
            return Err(reader.make_error(ErrorDetails::BadAdaptationHeader));
        }
        let mut a_reader = reader.new_sub_reader(adaptation_field_length - 1)?;
        if out.header.has_pcr() {
            if a_reader.remaining_len() < 6 {
                warn!("Short read of PCR");
                return Err(reader.make_error(ErrorDetails::BadAdaptationHeader));
            }
            out.pcr = Some(parse_pcr(a_reader.read_array_ref::<6>()?));
        }
        if out.header.has_opcr() {
            if a_reader.remaining_len() < 6 {
                warn!("Short read of OPCR");
                return Err(reader.make_error(ErrorDetails::BadAdaptationHeader));
            }
            out.opcr = Some(parse_pcr(a_reader.read_array_ref::<6>()?));
        }

        Ok(out)
    }

    fn read_payload<'a>(
        &mut self,
        pusi: bool,
        pid: u16,
        mut reader: SliceReader<'a>,
    ) -> Result<Payload<'a>> {
        if pusi {
            /* Make sure we're not starting an already-started unit */
            if self.pending_payload_units.contains_key(&pid) {
                warn!("Discarding unfinished unit packet on PID: {:x}", pid);
                self.pending_payload_units.remove(&pid);
            }

            /* Check for PAT/PMT/NIT */
            if pid == 0 || self.known_pmt_pids.contains(&pid) {
                self.start_psi(pid, &mut reader)
            }
            /* Check for PES if enough payload is present */
            else if reader.remaining_len() >= 6 && is_pes(reader.peek_array_ref::<3>()?) {
                /* PES packet detected */
                self.start_pes(pid, &mut reader)
            } else {
                /* Not enough payload for a PES packet, assume raw */
                Ok(Payload::Raw(reader))
            }
        } else {
            /* Attempt unit continuation */
            self.continue_payload_unit(pid, &mut reader)
        }
    }

    /// Parse data for exactly one 188-byte MPEG-TS packet.
    ///
    /// All information about the packet is returned as [`Packet`].
    ///
    /// For payload units that span multiple packets, the relevant pending state is provided in
    /// [`Payload`]. Once the final packet of the unit is read, the entire unit is parsed and made
    /// available in the [`Payload`].
    pub fn parse<'a>(&mut self, packet: &'a [u8; 188]) -> Result<Packet<'a>> {
        let mut reader = SliceReader::new(packet);

        /* Start with header and verify sync */
        let mut out = Packet {
            header: read_bitfield!(reader, PacketHeader),
            adaptation_field: None,
            payload: None,
        };
        if out.header.sync_byte() != 0x47 {
            return Err(reader.make_error(ErrorDetails::LostSync));
        }

        /* Special cases exist for some PIDs */
        let pid = out.header.pid();

        /* Discard null packets early */
        if pid == 0x1fff {
            return Ok(out);
        }

        /* Read adaptation field if it exists */
        if out.header.has_adaptation_field() {
            out.adaptation_field = Some(self.read_adaptation_field(&mut reader)?);
        }

        /* Read payload if it exists */
        if out.header.has_payload() {
            out.payload = Some(self.read_payload(out.header.pusi(), pid, reader)?);
        }

        Ok(out)
    }
}
