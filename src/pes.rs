use super::{
    parse_timestamp, pts_format_args, ErrorDetails, Payload, Result, SliceReader, TsDemuxer,
};
use crate::payload_unit::PayloadUnitObject;
use log::warn;
use modular_bitfield_msb::prelude::*;
use std::fmt::{Debug, Formatter};

/// Fixed six-byte header starting every PES packet.
#[bitfield]
#[derive(Debug)]
pub struct PesHeader {
    pub start_code: B24,
    pub stream_id: B8,
    pub packet_length: B16,
}

/// Optional header area present for all stream ids except private_stream_2 and friends.
#[bitfield]
#[derive(Debug)]
pub struct PesOptionalHeader {
    pub marker_bits: B2,
    pub scrambling_control: B2,
    pub priority: bool,
    pub data_alignment_indicator: bool,
    pub copyright: bool,
    pub original: bool,
    pub has_pts: bool,
    pub has_dts: bool,
    pub escr: bool,
    pub es_rate: bool,
    pub dsm_trick_mode: bool,
    pub has_additional_copy_info: bool,
    pub has_crc: bool,
    pub has_extension: bool,
    pub additional_header_length: B8,
}

/// A PES packet reassembled from one or more transport stream packets.
///
/// `data` holds the payload only; the fixed and optional headers are stripped during
/// reassembly.
pub struct Pes {
    pub header: PesHeader,
    pub optional_header: Option<PesOptionalHeader>,
    pub pts: u64,
    pub dts: u64,
    pub data: Vec<u8>,
}

impl Pes {
    pub(crate) fn new(
        capacity: usize,
        header: PesHeader,
        optional_header: Option<PesOptionalHeader>,
        pts: u64,
        dts: u64,
    ) -> Self {
        Self {
            header,
            optional_header,
            pts,
            dts,
            data: Vec::with_capacity(capacity),
        }
    }
}

impl PayloadUnitObject for Pes {
    fn extend_from_slice(&mut self, slice: &[u8]) {
        self.data.extend_from_slice(slice);
    }

    fn finish<'a>(self, _pid: u16, _demuxer: &mut TsDemuxer) -> Result<Payload<'a>> {
        Ok(Payload::Pes(self))
    }

    fn pending<'a>(&self) -> Result<Payload<'a>> {
        Ok(Payload::PesPending)
    }
}

impl Debug for Pes {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pes")
            .field("header", &self.header)
            .field("optional_header", &self.optional_header)
            .field("pts", &pts_format_args!(self.pts))
            .field("dts", &pts_format_args!(self.dts))
            .field("data.len()", &self.data.len())
            .finish()
    }
}

impl TsDemuxer {
    pub(crate) fn start_pes<'a>(
        &mut self,
        pid: u16,
        reader: &mut SliceReader<'a>,
    ) -> Result<Payload<'a>> {
        let pes_header = PesHeader::from_bytes(*reader.read_array_ref::<6>()?);
        let pes_length = pes_header.packet_length() as usize;
        let mut optional_length = 0;
        let mut pts = 0;
        let mut dts = 0;
        let pes_optional = if pes_length >= 3 && pes_header.stream_id() != 0xBF {
            let pes_optional = PesOptionalHeader::from_bytes(*reader.read_array_ref::<3>()?);
            let additional_length = pes_optional.additional_header_length() as usize;
            optional_length = 3 + additional_length;
            let mut o_reader = reader.new_sub_reader(additional_length)?;

            if pes_optional.has_pts() {
                if o_reader.remaining_len() < 5 {
                    warn!("Short read of PTS");
                    return Err(o_reader.make_error(ErrorDetails::BadPesHeader));
                }
                pts = parse_timestamp(o_reader.read_array_ref::<5>()?);
            }

            if pes_optional.has_dts() {
                if o_reader.remaining_len() < 5 {
                    warn!("Short read of DTS");
                    return Err(o_reader.make_error(ErrorDetails::BadPesHeader));
                }
                dts = parse_timestamp(o_reader.read_array_ref::<5>()?);
            }

            Some(pes_optional)
        } else {
            None
        };

        if pes_length < optional_length {
            warn!("PES length shorter than its optional header");
            return Err(reader.make_error(ErrorDetails::BadPesHeader));
        }

        let unit_length = pes_length - optional_length;
        self.start_payload_unit(
            Pes::new(unit_length, pes_header, pes_optional, pts, dts),
            unit_length,
            pid,
            reader,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{make_packet, make_pes};
    use crate::Payload;

    #[test]
    fn parses_pts_from_optional_header() {
        // PTS of 900000 (10 seconds at 90kHz)
        let pts: u64 = 900000;
        let mut pes = vec![0x00, 0x00, 0x01, 0xBD, 0x00, 0x09];
        pes.extend_from_slice(&[0x80, 0x80, 0x05]);
        pes.push(0x21 | ((pts >> 29) as u8 & 0x0E));
        pes.push((pts >> 22) as u8);
        pes.push(0x01 | ((pts >> 14) as u8 & 0xFE));
        pes.push((pts >> 7) as u8);
        pes.push(0x01 | ((pts << 1) as u8 & 0xFE));
        pes.push(0x42);

        let mut demuxer = TsDemuxer::default();
        let packet = make_packet(0x0100, true, 0, &pes);
        let parsed = demuxer.parse(&packet).unwrap();
        match parsed.payload {
            Some(Payload::Pes(pes)) => {
                assert_eq!(pes.pts, 900000);
                assert_eq!(pes.data, [0x42]);
            }
            other => panic!("expected complete PES, got {:?}", other),
        }
    }

    #[test]
    fn strips_header_from_payload() {
        let mut demuxer = TsDemuxer::default();
        let pes = make_pes(&[0x01, 0x02, 0x03]);
        let packet = make_packet(0x0100, true, 0, &pes);
        let parsed = demuxer.parse(&packet).unwrap();
        match parsed.payload {
            Some(Payload::Pes(pes)) => assert_eq!(pes.data, [0x01, 0x02, 0x03]),
            other => panic!("expected complete PES, got {:?}", other),
        }
    }
}
