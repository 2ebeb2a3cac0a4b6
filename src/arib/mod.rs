//! Application module for ARIB STD-B24 caption data carried in PES payloads.
//!
//! Parses the container hierarchy (data group, caption management/statement data, data units)
//! down to the statement byte stream handled by [`decoder`] and the custom glyph definitions
//! handled by [`drcs`].

use crate::{ErrorDetails, Result, SliceReader, DATA_GROUP_CRC};
use log::debug;
use num_derive::FromPrimitive;
use smallvec::SmallVec;

pub mod decoder;
pub mod drcs;

use drcs::DrcsDataUnit;

fn from_primitive_map_err<
    T: num_traits::FromPrimitive,
    U: Clone + Into<u64>,
    E,
    F: FnOnce(U) -> E,
>(
    val: U,
    err_fn: F,
) -> std::result::Result<T, E> {
    match num_traits::FromPrimitive::from_u64(val.clone().into()) {
        Some(v) => Ok(v),
        None => Err(err_fn(val)),
    }
}

/// Data unit parameter value for caption statement text.
const UNIT_STATEMENT_BODY: u8 = 0x20;
/// Data unit parameter value for one-byte DRCS definitions.
const UNIT_DRCS_1_BYTE: u8 = 0x30;

/// Time control mode attached to caption management and statement data.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
pub enum TimeControlMode {
    /// Presented as received.
    Free,
    /// Presented at the attached playback time.
    RealTime,
    /// Presented at the attached playback time shifted by the offset time.
    OffsetTime,
    /// Do not use.
    Reserved,
}

/// Display mode nibble halves of a caption language record.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
pub enum DisplayMode {
    /// Displayed automatically.
    AutoDisplay,
    /// Hidden automatically.
    AutoHide,
    /// Displayed when selected by the viewer.
    Selectable,
    /// Displayed under receiver-specific conditions.
    MayDisplay,
}

/// One language record from caption management data.
#[derive(Debug)]
pub struct CaptionLanguage {
    /// Language identification within the service (3 bits).
    pub language_tag: u8,
    /// Display mode when receiving.
    pub dmf_receive: DisplayMode,
    /// Display mode during recorded playback.
    pub dmf_playback: DisplayMode,
    /// Display condition byte, present for the conditional display modes.
    pub dc: Option<u8>,
    /// ISO 639-2 language code, e.g. "jpn".
    pub iso_639_language_code: String,
    /// Display format nibble.
    pub format: u8,
    /// Character coding (TCS) bits.
    pub tcs: u8,
    /// Rollup mode bits.
    pub rollup_mode: u8,
}

impl CaptionLanguage {
    fn parse(reader: &mut SliceReader) -> Result<Self> {
        let b = reader.read_u8()?;
        let language_tag = b >> 5;
        let dmf = b & 0x0F;
        let dmf_receive = from_primitive_map_err(dmf >> 2, |_: u8| {
            reader.make_error(ErrorDetails::BadDataGroup)
        })?;
        let dmf_playback = from_primitive_map_err(dmf & 0x3, |_: u8| {
            reader.make_error(ErrorDetails::BadDataGroup)
        })?;
        let dc = if dmf == 0b1100 || dmf == 0b1101 || dmf == 0b1110 {
            Some(reader.read_u8()?)
        } else {
            None
        };
        let iso_639_language_code = reader.read_array_ref::<3>()?.iter().map(|&c| c as char).collect();
        let formats = reader.read_u8()?;
        Ok(Self {
            language_tag,
            dmf_receive,
            dmf_playback,
            dc,
            iso_639_language_code,
            format: formats >> 4,
            tcs: (formats >> 2) & 0x3,
            rollup_mode: formats & 0x3,
        })
    }

    /// Human readable name of the display format nibble.
    pub fn display_format(&self) -> &'static str {
        match self.format {
            0x0 => "horizontal writing in standard density",
            0x1 => "vertical writing in standard density",
            0x2 => "horizontal writing in high density",
            0x3 => "vertical writing in high density",
            0x4 => "horizontal writing of Western language",
            0x6 => "horizontal writing in 1920x1080",
            0x7 => "vertical writing in 1920x1080",
            0x8 => "horizontal writing in 960x540",
            0x9 => "vertical writing in 960x540",
            0xA => "horizontal writing in 1280x720",
            0xB => "vertical writing in 1280x720",
            0xC => "horizontal writing in 720x480",
            0xD => "vertical writing in 720x480",
            _ => "invalid display format",
        }
    }
}

/// One data unit from a caption management or statement data loop.
#[derive(Debug)]
pub enum DataUnit<'a> {
    /// Caption text statement bytes, decoded by [`decoder::StatementDecoder`].
    StatementBody(&'a [u8]),
    /// One-byte DRCS glyph definitions.
    Drcs(DrcsDataUnit),
    /// Recognized but unhandled unit kind; its payload was consumed and dropped.
    Skipped {
        /// Data unit parameter byte.
        unit_type: u8,
    },
}

fn parse_data_units<'a>(reader: &mut SliceReader<'a>) -> Result<Vec<DataUnit<'a>>> {
    let mut units = Vec::new();
    while reader.remaining_len() > 0 {
        let unit_separator = reader.read_u8()?;
        if unit_separator != 0x1F {
            return Err(reader.make_error(ErrorDetails::MalformedUnit(unit_separator)));
        }
        let unit_type = reader.read_u8()?;
        let size = reader.read_be_u24()? as usize;
        let mut unit_reader = reader.new_sub_reader(size)?;
        units.push(match unit_type {
            UNIT_STATEMENT_BODY => DataUnit::StatementBody(unit_reader.read_to_end()?),
            UNIT_DRCS_1_BYTE => DataUnit::Drcs(DrcsDataUnit::parse(&mut unit_reader)?),
            _ => {
                debug!("skipping data unit type {:#04x} ({} bytes)", unit_type, size);
                DataUnit::Skipped { unit_type }
            }
        });
    }
    Ok(units)
}

/// Caption management data: the languages present and their display parameters.
#[derive(Debug)]
pub struct CaptionManagementData<'a> {
    /// Time control mode.
    pub tmd: TimeControlMode,
    /// Offset time word (36 bits), present for [`TimeControlMode::OffsetTime`].
    pub otm: Option<u64>,
    /// Language records.
    pub languages: SmallVec<[CaptionLanguage; 2]>,
    /// Data units attached to the management group.
    pub data_units: Vec<DataUnit<'a>>,
}

impl<'a> CaptionManagementData<'a> {
    fn parse(reader: &mut SliceReader<'a>) -> Result<Self> {
        let tmd = from_primitive_map_err(reader.read_u8()? >> 6, |_: u8| {
            reader.make_error(ErrorDetails::BadDataGroup)
        })?;
        let otm = if tmd == TimeControlMode::OffsetTime {
            Some(reader.read_be_u40()? >> 4)
        } else {
            None
        };
        let num_languages = reader.read_u8()?;
        let mut languages = SmallVec::new();
        for _ in 0..num_languages {
            languages.push(CaptionLanguage::parse(reader)?);
        }
        let data_unit_loop_length = reader.read_be_u24()? as usize;
        let mut unit_reader = reader.new_sub_reader(data_unit_loop_length)?;
        Ok(Self {
            tmd,
            otm,
            languages,
            data_units: parse_data_units(&mut unit_reader)?,
        })
    }
}

/// Caption statement data: the text stream for one language.
#[derive(Debug)]
pub struct CaptionStatementData<'a> {
    /// Time control mode.
    pub tmd: TimeControlMode,
    /// Presentation start time word (36 bits), present for the timed control modes.
    pub stm: Option<u64>,
    /// Data units holding statement bodies and DRCS definitions.
    pub data_units: Vec<DataUnit<'a>>,
}

impl<'a> CaptionStatementData<'a> {
    fn parse(reader: &mut SliceReader<'a>) -> Result<Self> {
        let tmd = from_primitive_map_err(reader.read_u8()? >> 6, |_: u8| {
            reader.make_error(ErrorDetails::BadDataGroup)
        })?;
        let stm = if matches!(tmd, TimeControlMode::RealTime | TimeControlMode::OffsetTime) {
            Some(reader.read_be_u40()? >> 4)
        } else {
            None
        };
        let data_unit_loop_length = reader.read_be_u24()? as usize;
        let mut unit_reader = reader.new_sub_reader(data_unit_loop_length)?;
        Ok(Self {
            tmd,
            stm,
            data_units: parse_data_units(&mut unit_reader)?,
        })
    }
}

/// Payload of a [`DataGroup`], selected by the group id.
#[derive(Debug)]
pub enum DataGroupPayload<'a> {
    /// Caption management data (group ids 0x00 and 0x20).
    Management(CaptionManagementData<'a>),
    /// Caption statement data (one group id per language).
    Statement(CaptionStatementData<'a>),
}

/// Top level ARIB caption container within one PES payload.
#[derive(Debug)]
pub struct DataGroup<'a> {
    /// Data group id (6 bits).
    pub id: u8,
    /// Data group version (2 bits).
    pub version: u8,
    /// Data group link number.
    pub link_number: u8,
    /// Last data group link number.
    pub last_link_number: u8,
    /// Management or statement payload.
    pub payload: DataGroupPayload<'a>,
}

impl<'a> DataGroup<'a> {
    /// True when the group carries caption management data.
    pub fn is_management(&self) -> bool {
        self.id & 0x0F == 0
    }

    /// Parses a data group, including the trailing CRC.
    ///
    /// The CRC is checked with CRC-16/IBM-3740 but a mismatch only logs; receivers in the wild
    /// accept these groups and so do we.
    pub fn parse(reader: &mut SliceReader<'a>) -> Result<Self> {
        let whole = reader.peek_remaining();
        let b = reader.read_u8()?;
        let id = b >> 2;
        let version = b & 0x3;
        let link_number = reader.read_u8()?;
        let last_link_number = reader.read_u8()?;
        let size = reader.read_be_u16()? as usize;
        let mut body = reader.new_sub_reader(size)?;
        let crc = reader.read_be_u16()?;
        let computed = DATA_GROUP_CRC.checksum(&whole[..5 + size]);
        if crc != computed {
            debug!(
                "data group CRC mismatch (group {:#04x}): {:#06x} != {:#06x}",
                id, crc, computed
            );
        }
        let payload = if id & 0x0F == 0 {
            DataGroupPayload::Management(CaptionManagementData::parse(&mut body)?)
        } else {
            DataGroupPayload::Statement(CaptionStatementData::parse(&mut body)?)
        };
        Ok(Self {
            id,
            version,
            link_number,
            last_link_number,
            payload,
        })
    }

    /// Parses the synchronized/asynchronous PES data wrapper around a data group.
    ///
    /// The wrapper is a data identifier (0x80 synchronized, 0x81 asynchronous), the private
    /// stream id, and a 4-bit header length governing an additional skip.
    pub fn from_pes_payload(payload: &'a [u8]) -> Result<Self> {
        let mut reader = SliceReader::new(payload);
        let data_identifier = reader.read_u8()?;
        if data_identifier != 0x80 && data_identifier != 0x81 {
            return Err(reader.make_error(ErrorDetails::BadSyncPesHeader));
        }
        let _private_stream_id = reader.read_u8()?;
        let header_length = (reader.read_u8()? & 0x0F) as usize;
        reader.skip(header_length)?;
        Self::parse(&mut reader)
    }
}
