use super::{CrcDigest, Error, ErrorDetails, Payload, Result, SliceReader, TsDemuxer, CRC};
use crate::payload_unit::PayloadUnitObject;
use log::warn;
use modular_bitfield_msb::prelude::*;
use smallvec::SmallVec;

/// Elementary stream type carrying PES private data (ARIB captions use this).
pub(crate) const STREAM_TYPE_PES_PRIVATE_DATA: u8 = 0x06;

/// Descriptor tag assigning a component tag to an elementary stream.
const STREAM_IDENTIFIER_DESCRIPTOR: u8 = 0x52;

#[bitfield]
#[derive(Debug)]
pub struct PsiHeader {
    pub table_id: B8,
    pub section_syntax_indicator: bool,
    pub private_bit: bool,
    pub reserved_bits: B2,
    #[skip]
    pub unused_bits: B2,
    pub section_length: B10,
}

#[bitfield]
#[derive(Debug)]
pub struct PsiTableSyntax {
    pub table_id_extension: B16,
    pub reserved_bits: B2,
    pub version: B5,
    pub current_next_indicator: bool,
    pub section_num: B8,
    pub last_section_num: B8,
}

#[bitfield]
#[derive(Debug)]
pub struct PatEntry {
    pub program_num: B16,
    pub reserved: B3,
    pub program_map_pid: B13,
}

#[derive(Debug)]
pub struct Descriptor {
    pub tag: u8,
    pub data: SmallVec<[u8; 8]>,
}

impl Descriptor {
    pub fn new_from_reader(reader: &mut SliceReader) -> Result<Self> {
        let tag_len = reader.read_array_ref::<2>()?;
        let mut data = SmallVec::<[u8; 8]>::new();
        data.extend_from_slice(reader.read(tag_len[1] as usize)?);
        Ok(Self {
            tag: tag_len[0],
            data,
        })
    }

    /// True for a stream_identifier descriptor whose component tag is one of the ARIB
    /// non-partial-reception caption tags.
    fn is_caption_component(&self) -> bool {
        self.tag == STREAM_IDENTIFIER_DESCRIPTOR
            && self.data.first().is_some_and(|tag| (0x30..=0x37).contains(tag))
    }
}

#[bitfield]
#[derive(Debug)]
pub struct PmtHeader {
    pub reserved: B3,
    pub pcr_pid: B13,
    pub reserved2: B4,
    #[skip]
    pub unused_bits: B2,
    pub program_info_length: B10,
}

#[bitfield]
#[derive(Debug)]
pub struct ElementaryStreamInfoHeader {
    pub stream_type: B8,
    pub reserved: B3,
    pub elementary_pid: B13,
    pub reserved2: B4,
    #[skip]
    pub unused_bits: B2,
    pub es_info_length: B10,
}

#[derive(Debug)]
pub struct ElementaryStreamInfo {
    pub header: ElementaryStreamInfoHeader,
    pub es_descriptors: SmallVec<[Descriptor; 4]>,
}

#[derive(Debug)]
pub struct Pmt {
    pub header: PmtHeader,
    pub program_descriptors: Vec<Descriptor>,
    pub es_infos: Vec<ElementaryStreamInfo>,
}

impl Pmt {
    /// PIDs of elementary streams that announce themselves as caption components.
    pub fn caption_pids(&self) -> Vec<u16> {
        self.es_infos
            .iter()
            .filter(|es| {
                es.header.stream_type() == STREAM_TYPE_PES_PRIVATE_DATA
                    && es.es_descriptors.iter().any(Descriptor::is_caption_component)
            })
            .map(|es| es.header.elementary_pid())
            .collect()
    }
}

#[derive(Debug)]
pub enum PsiData {
    Raw(Vec<u8>),
    Pat(Vec<PatEntry>),
    Pmt(Pmt),
    Nit(Vec<u8>),
}

#[derive(Debug)]
pub struct Psi {
    pub header: PsiHeader,
    pub table_syntax: Option<PsiTableSyntax>,
    pub data: PsiData,
}

pub(crate) struct PsiBuilder {
    header: PsiHeader,
    table_syntax: Option<PsiTableSyntax>,
    data: Vec<u8>,
    hasher: CrcDigest,
}

impl PsiBuilder {
    pub fn new(
        capacity: usize,
        header: PsiHeader,
        table_syntax: Option<PsiTableSyntax>,
        hasher: CrcDigest,
    ) -> Self {
        Self {
            header,
            table_syntax,
            data: Vec::with_capacity(capacity),
            hasher,
        }
    }
}

impl PayloadUnitObject for PsiBuilder {
    fn extend_from_slice(&mut self, slice: &[u8]) {
        self.data.extend_from_slice(slice);
    }

    fn finish<'a>(mut self, pid: u16, demuxer: &mut TsDemuxer) -> Result<Payload<'a>> {
        /* Validate using CRC32 */
        if self.data.len() < 4 {
            warn!("PSI section too short for CRC on PID: {:x}", pid);
            return Err(Error::new(0, ErrorDetails::BadPsiHeader));
        }
        let len_minus_crc = self.data.len() - 4;
        self.hasher.update(&self.data[..len_minus_crc]);
        let actual_hash = self.hasher.finalize();
        let expected_hash = u32::from_be_bytes(
            *SliceReader::new(&self.data[len_minus_crc..])
                .read_array_ref::<4>()
                .unwrap(),
        );
        if expected_hash != actual_hash {
            warn!("PSI hash mismatch for PID: {:x}", pid);
            return Err(Error::new(0, ErrorDetails::PsiCrcMismatch));
        }
        self.data.truncate(len_minus_crc);

        /* Process table based on known type */
        if pid == 0 && self.header.table_id() == 0 {
            /* PAT */
            demuxer.nit_pid = 0x0010;
            demuxer.known_pmt_pids.clear();
            let mut reader = SliceReader::new(self.data.as_slice());
            let mut pat_vec = Vec::with_capacity(reader.remaining_len() / 4);
            while reader.remaining_len() >= 4 {
                let entry = PatEntry::from_bytes(*reader.read_array_ref::<4>().unwrap());
                if entry.program_num() == 0 {
                    demuxer.nit_pid = entry.program_map_pid();
                } else {
                    demuxer.known_pmt_pids.insert(entry.program_map_pid());
                }
                pat_vec.push(entry);
            }
            Ok(Payload::Psi(Psi {
                header: self.header,
                table_syntax: self.table_syntax,
                data: PsiData::Pat(pat_vec),
            }))
        } else if demuxer.nit_pid == pid {
            /* NIT */
            Ok(Payload::Psi(Psi {
                header: self.header,
                table_syntax: self.table_syntax,
                data: PsiData::Nit(self.data),
            }))
        } else if demuxer.known_pmt_pids.contains(&pid) {
            /* PMT */
            let mut reader = SliceReader::new(self.data.as_slice());
            let header = PmtHeader::from_bytes(*reader.read_array_ref::<4>()?);
            let mut pmt = Pmt {
                header,
                program_descriptors: Vec::new(),
                es_infos: Vec::new(),
            };
            let mut info_reader = reader.new_sub_reader(pmt.header.program_info_length() as usize)?;
            while info_reader.remaining_len() > 0 {
                let descriptor = Descriptor::new_from_reader(&mut info_reader)?;
                pmt.program_descriptors.push(descriptor);
            }
            while reader.remaining_len() > 0 {
                let es_header = ElementaryStreamInfoHeader::from_bytes(*reader.read_array_ref::<5>()?);
                let mut es_info = ElementaryStreamInfo {
                    header: es_header,
                    es_descriptors: SmallVec::new(),
                };
                let mut es_reader = reader.new_sub_reader(es_info.header.es_info_length() as usize)?;
                while es_reader.remaining_len() > 0 {
                    let descriptor = Descriptor::new_from_reader(&mut es_reader)?;
                    es_info.es_descriptors.push(descriptor);
                }
                pmt.es_infos.push(es_info);
            }
            Ok(Payload::Psi(Psi {
                header: self.header,
                table_syntax: self.table_syntax,
                data: PsiData::Pmt(pmt),
            }))
        } else {
            /* Unhandled table type; keep data raw */
            Ok(Payload::Psi(Psi {
                header: self.header,
                table_syntax: self.table_syntax,
                data: PsiData::Raw(self.data),
            }))
        }
    }

    fn pending<'a>(&self) -> Result<Payload<'a>> {
        Ok(Payload::PsiPending)
    }
}

impl TsDemuxer {
    pub(crate) fn start_psi<'a>(
        &mut self,
        pid: u16,
        reader: &mut SliceReader<'a>,
    ) -> Result<Payload<'a>> {
        if reader.remaining_len() < 1 {
            warn!("Short read of PSI pointer field");
            return Err(reader.make_error(ErrorDetails::BadPsiHeader));
        }
        let pointer_field = reader.read(1)?[0];
        if reader.remaining_len() < pointer_field as usize {
            warn!("Short read of PSI pointer filler");
            return Err(reader.make_error(ErrorDetails::BadPsiHeader));
        }
        reader.skip(pointer_field as usize)?;

        if reader.remaining_len() < 3 {
            warn!("Short read of PSI header");
            return Err(reader.make_error(ErrorDetails::BadPsiHeader));
        }
        let mut hasher = CRC.digest();
        let psi_header_bytes = reader.read_array_ref::<3>()?;
        hasher.update(psi_header_bytes);
        let psi_header = PsiHeader::from_bytes(*psi_header_bytes);
        let section_length = psi_header.section_length();

        if section_length > 0 {
            if reader.remaining_len() < 5 {
                warn!("Short read of PSI table syntax");
                return Err(reader.make_error(ErrorDetails::BadPsiHeader));
            }
            let psi_table_syntax_bytes = reader.read_array_ref::<5>()?;
            hasher.update(psi_table_syntax_bytes);
            let psi_table_syntax = PsiTableSyntax::from_bytes(*psi_table_syntax_bytes);

            let table_length = (section_length - 5) as usize;
            if table_length < 4 {
                /* Must have length to read at least the CRC32 */
                warn!("Insufficient table length");
                return Err(reader.make_error(ErrorDetails::BadPsiHeader));
            }

            self.start_payload_unit(
                PsiBuilder::new(table_length, psi_header, Some(psi_table_syntax), hasher),
                table_length,
                pid,
                reader,
            )
        } else {
            PsiBuilder::new(0, psi_header, None, hasher).finish(pid, self)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::make_packet;
    use crate::CRC;

    fn make_section(table_id: u8, syntax: [u8; 5], body: &[u8]) -> Vec<u8> {
        let section_length = (5 + body.len() + 4) as u16;
        let mut section = vec![
            0x00, // pointer field
            table_id,
            0xB0 | (section_length >> 8) as u8,
            (section_length & 0xFF) as u8,
        ];
        section.extend_from_slice(&syntax);
        section.extend_from_slice(body);
        let crc = CRC.checksum(&section[1..]);
        section.extend_from_slice(&crc.to_be_bytes());
        section
    }

    #[test]
    fn pat_registers_pmt_pids_and_pmt_reports_caption_streams() {
        let mut demuxer = TsDemuxer::default();

        // PAT announcing program 1 on PID 0x1000
        let pat = make_section(
            0x00,
            [0x00, 0x01, 0xC1, 0x00, 0x00],
            &[0x00, 0x01, 0xE0 | 0x10, 0x00],
        );
        let packet = make_packet(0x0000, true, 0, &pat);
        let parsed = demuxer.parse(&packet).unwrap();
        match parsed.payload {
            Some(Payload::Psi(Psi {
                data: PsiData::Pat(entries),
                ..
            })) => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].program_map_pid(), 0x1000);
            }
            other => panic!("expected PAT, got {:?}", other),
        }

        // PMT with one private-data stream on PID 0x0140 tagged as a caption component
        let mut body = vec![0xE0 | 0x01, 0x00, 0xF0, 0x00];
        body.extend_from_slice(&[
            STREAM_TYPE_PES_PRIVATE_DATA,
            0xE0 | 0x01,
            0x40,
            0xF0,
            0x03,
            STREAM_IDENTIFIER_DESCRIPTOR,
            0x01,
            0x30,
        ]);
        let pmt = make_section(0x02, [0x00, 0x01, 0xC1, 0x00, 0x00], &body);
        let packet = make_packet(0x1000, true, 0, &pmt);
        let parsed = demuxer.parse(&packet).unwrap();
        match parsed.payload {
            Some(Payload::Psi(Psi {
                data: PsiData::Pmt(pmt),
                ..
            })) => {
                assert_eq!(pmt.caption_pids(), [0x0140]);
            }
            other => panic!("expected PMT, got {:?}", other),
        }
    }

    #[test]
    fn corrupt_crc_is_rejected() {
        let mut demuxer = TsDemuxer::default();
        let mut pat = make_section(
            0x00,
            [0x00, 0x01, 0xC1, 0x00, 0x00],
            &[0x00, 0x01, 0xE0 | 0x10, 0x00],
        );
        let last = pat.len() - 1;
        pat[last] ^= 0xFF;
        let err = demuxer.parse(&make_packet(0x0000, true, 0, &pat)).unwrap_err();
        assert!(matches!(err.details, ErrorDetails::PsiCrcMismatch));
    }
}
