//! Stateful decoder for the eight-bit caption statement byte stream.
//!
//! ARIB multiplexes several graphic character sets into one byte stream through four
//! designation registers (G0..G3) and two invocation registers (GL for 0x21..=0x7E, GR for
//! 0xA1..=0xFE). Escape sequences remap the designations, locking shifts move the
//! invocations, and the C0/C1 areas carry display controls. The decoder walks one statement
//! body and emits [`CaptionToken`]s for the formatter.

use super::drcs::{DrcsTable, DRCS_REPLACEMENT};
use crate::{ErrorDetails, Result, SliceReader};
use encoding_rs::EUC_JP;

/// Fallback for two-byte codes outside the EUC-JP mapping (ARIB additions).
const GETA: char = '〓';

/// Graphic character set a designation register can point at.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum GraphicSet {
    Kanji,
    Alphanumeric,
    Hiragana,
    Katakana,
    /// DRCS set 0 (two-byte) through 15 (one-byte).
    Drcs(u8),
    Macro,
    /// Designated but undecodable here (mosaic sets and friends).
    Unsupported(u8),
}

impl GraphicSet {
    fn is_multi_byte(self) -> bool {
        matches!(self, GraphicSet::Kanji | GraphicSet::Drcs(0))
    }

    fn from_final_one_byte(f: u8) -> Self {
        match f {
            0x4A => GraphicSet::Alphanumeric,
            0x30 => GraphicSet::Hiragana,
            0x31 => GraphicSet::Katakana,
            _ => GraphicSet::Unsupported(f),
        }
    }

    fn from_final_multi_byte(f: u8) -> Self {
        match f {
            // 0x39 and 0x3A designate the JIS compatible and X 0213 kanji planes.
            0x42 | 0x39 | 0x3A => GraphicSet::Kanji,
            _ => GraphicSet::Unsupported(f),
        }
    }

    fn from_final_drcs(f: u8) -> Self {
        match f {
            0x40..=0x4F => GraphicSet::Drcs(f - 0x40),
            0x70 => GraphicSet::Macro,
            _ => GraphicSet::Unsupported(f),
        }
    }
}

/// Which character repertoire a [`CaptionToken::Char`] came from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CharKind {
    Kanji,
    Hiragana,
    Katakana,
    Alphanumeric,
    Drcs,
}

/// Foreground fill colors of the C1 area.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CaptionColor {
    Black,
    Red,
    Green,
    Yellow,
    Blue,
    Magenta,
    Cyan,
    White,
}

impl CaptionColor {
    /// ASS primary color override for this fill (blue-green-red byte order).
    pub fn ass_override(self) -> &'static str {
        match self {
            CaptionColor::Black => "{\\c&H000000&}",
            CaptionColor::Red => "{\\c&H0000ff&}",
            CaptionColor::Green => "{\\c&H00ff00&}",
            CaptionColor::Yellow => "{\\c&H00ffff&}",
            CaptionColor::Blue => "{\\c&Hff0000&}",
            CaptionColor::Magenta => "{\\c&Hff00ff&}",
            CaptionColor::Cyan => "{\\c&Hffff00&}",
            CaptionColor::White => "{\\c&Hffffff&}",
        }
    }
}

/// One decoded element of a caption statement.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptionToken {
    /// A displayable character (possibly a multi-character DRCS substitute).
    Char {
        /// Repertoire the character came from.
        kind: CharKind,
        /// Decoded text.
        text: String,
    },
    /// Active position set: move the caret to a character cell.
    Aps {
        /// Row, counted from the lower left per ARIB.
        row: u8,
        /// Column.
        col: u8,
    },
    /// Plain space.
    Space,
    /// Clear screen; the formatter flushes its dialog lines here.
    ClearScreen,
    /// Switch to normal size text.
    NormalSize,
    /// Switch to medium (half width) size text.
    MediumSize,
    /// Switch to small size text.
    SmallSize,
    /// Foreground color change.
    Color(CaptionColor),
    /// Color map control; parameters are consumed and dropped.
    Col,
    /// Control sequence: accumulated parameter bytes plus the final byte.
    Csi {
        /// E.g. `"170;389 a"` for an active coordinate position set.
        raw: String,
    },
    /// Recognized control with no display effect; ignored downstream.
    Unknown,
}

/// Decoder state for one statement body.
///
/// State is recreated per data unit; designations deliberately do not persist across PES
/// boundaries (matching fielded decoders, if not the letter of the standard).
pub struct StatementDecoder<'a> {
    g: [GraphicSet; 4],
    gl: usize,
    gr: usize,
    single_shift: Option<usize>,
    drcs: &'a DrcsTable,
}

impl<'a> StatementDecoder<'a> {
    pub fn new(drcs: &'a DrcsTable) -> Self {
        Self {
            g: [
                GraphicSet::Kanji,
                GraphicSet::Alphanumeric,
                GraphicSet::Hiragana,
                GraphicSet::Katakana,
            ],
            gl: 0,
            gr: 2,
            single_shift: None,
            drcs,
        }
    }

    /// Decodes one statement body into an ordered token sequence.
    pub fn decode(&mut self, body: &[u8]) -> Result<Vec<CaptionToken>> {
        let mut reader = SliceReader::new(body);
        let mut tokens = Vec::new();
        while reader.remaining_len() > 0 {
            if let Some(token) = self.decode_next(&mut reader)? {
                tokens.push(token);
            }
        }
        Ok(tokens)
    }

    fn decode_next(&mut self, reader: &mut SliceReader) -> Result<Option<CaptionToken>> {
        let b = reader.read_u8()?;
        Ok(match b {
            0x00..=0x1F => self.control_c0(b, reader)?,
            0x20 => Some(CaptionToken::Space),
            0x21..=0x7E => {
                let set = match self.single_shift.take() {
                    Some(index) => self.g[index],
                    None => self.g[self.gl],
                };
                Some(self.graphic(set, b, reader)?)
            }
            0x7F => None, // DEL
            0x80..=0x9F => self.control_c1(b, reader)?,
            0xA1..=0xFE => {
                let set = self.g[self.gr];
                Some(self.graphic(set, b & 0x7F, reader)?)
            }
            0xA0 | 0xFF => Some(CaptionToken::Unknown),
        })
    }

    fn graphic(
        &self,
        set: GraphicSet,
        first: u8,
        reader: &mut SliceReader,
    ) -> Result<CaptionToken> {
        let second = if set.is_multi_byte() {
            reader.read_u8()? & 0x7F
        } else {
            0
        };
        Ok(match set {
            GraphicSet::Kanji => CaptionToken::Char {
                kind: CharKind::Kanji,
                text: decode_kanji(first, second),
            },
            GraphicSet::Alphanumeric => CaptionToken::Char {
                kind: CharKind::Alphanumeric,
                text: fullwidth_alphanumeric(first).to_string(),
            },
            GraphicSet::Hiragana => CaptionToken::Char {
                kind: CharKind::Hiragana,
                text: hiragana(first).to_string(),
            },
            GraphicSet::Katakana => CaptionToken::Char {
                kind: CharKind::Katakana,
                text: katakana(first).to_string(),
            },
            GraphicSet::Drcs(0) => self.drcs_char(u16::from_be_bytes([first, second])),
            GraphicSet::Drcs(set_index) => {
                self.drcs_char(((0x40 + set_index) as u16) << 8 | first as u16)
            }
            GraphicSet::Macro | GraphicSet::Unsupported(_) => CaptionToken::Unknown,
        })
    }

    fn drcs_char(&self, character_code: u16) -> CaptionToken {
        CaptionToken::Char {
            kind: CharKind::Drcs,
            text: self
                .drcs
                .substitute(character_code)
                .unwrap_or(DRCS_REPLACEMENT)
                .to_string(),
        }
    }

    fn control_c0(&mut self, b: u8, reader: &mut SliceReader) -> Result<Option<CaptionToken>> {
        Ok(match b {
            0x0C => Some(CaptionToken::ClearScreen), // CS
            0x0E => {
                self.gl = 1; // LS1
                None
            }
            0x0F => {
                self.gl = 0; // LS0
                None
            }
            0x16 => {
                reader.read_u8()?; // PAPF parameter
                Some(CaptionToken::Unknown)
            }
            0x19 => {
                self.single_shift = Some(2); // SS2
                None
            }
            0x1B => {
                self.escape(reader)?;
                None
            }
            0x1C => {
                let p = reader.read_array_ref::<2>()?; // APS
                Some(CaptionToken::Aps {
                    row: p[0] & 0x3F,
                    col: p[1] & 0x3F,
                })
            }
            0x1D => {
                self.single_shift = Some(3); // SS3
                None
            }
            // NUL BEL APB APF APD APU APR RS US
            _ => Some(CaptionToken::Unknown),
        })
    }

    /// Designation escape sequences per ARIB Table 7-3, plus the locking shifts.
    fn escape(&mut self, reader: &mut SliceReader) -> Result<()> {
        let b = reader.read_u8()?;
        match b {
            0x24 => {
                let b2 = reader.read_u8()?;
                match b2 {
                    0x28..=0x2B => {
                        let index = (b2 - 0x28) as usize;
                        let b3 = reader.read_u8()?;
                        self.g[index] = if b3 == 0x20 {
                            GraphicSet::from_final_drcs(reader.read_u8()?)
                        } else {
                            GraphicSet::from_final_multi_byte(b3)
                        };
                    }
                    _ => self.g[0] = GraphicSet::from_final_multi_byte(b2),
                }
            }
            0x28..=0x2B => {
                let index = (b - 0x28) as usize;
                let b2 = reader.read_u8()?;
                self.g[index] = if b2 == 0x20 {
                    GraphicSet::from_final_drcs(reader.read_u8()?)
                } else {
                    GraphicSet::from_final_one_byte(b2)
                };
            }
            0x6E => self.gl = 2, // LS2
            0x6F => self.gl = 3, // LS3
            0x7C => self.gr = 3, // LS3R
            0x7D => self.gr = 2, // LS2R
            0x7E => self.gr = 1, // LS1R
            _ => return Err(reader.make_error(ErrorDetails::BadEscapeSequence)),
        }
        Ok(())
    }

    fn control_c1(&mut self, b: u8, reader: &mut SliceReader) -> Result<Option<CaptionToken>> {
        Ok(Some(match b {
            0x80 => CaptionToken::Color(CaptionColor::Black), // BKF
            0x81 => CaptionToken::Color(CaptionColor::Red),   // RDF
            0x82 => CaptionToken::Color(CaptionColor::Green), // GRF
            0x83 => CaptionToken::Color(CaptionColor::Yellow), // YLF
            0x84 => CaptionToken::Color(CaptionColor::Blue),  // BLF
            0x85 => CaptionToken::Color(CaptionColor::Magenta), // MGF
            0x86 => CaptionToken::Color(CaptionColor::Cyan),  // CNF
            0x87 => CaptionToken::Color(CaptionColor::White), // WHF
            0x88 => CaptionToken::SmallSize,                  // SSZ
            0x89 => CaptionToken::MediumSize,                 // MSZ
            0x8A => CaptionToken::NormalSize,                 // NSZ
            0x8B | 0x91 | 0x93 | 0x94 | 0x97 | 0x98 => {
                // SZX FLC POL WMM HLC RPC: one parameter each
                reader.read_u8()?;
                CaptionToken::Unknown
            }
            0x90 => {
                // COL: one parameter, or an 0x20 intermediate plus one more
                if reader.read_u8()? == 0x20 {
                    reader.read_u8()?;
                }
                CaptionToken::Col
            }
            0x92 => {
                // CDC: same parameter shape as COL
                if reader.read_u8()? == 0x20 {
                    reader.read_u8()?;
                }
                CaptionToken::Unknown
            }
            0x95 => {
                // MACRO definition: skip through the terminating MACRO 0x4F
                let p1 = reader.read_u8()?;
                if p1 == 0x40 || p1 == 0x41 {
                    loop {
                        if reader.read_u8()? == 0x95 && reader.read_u8()? == 0x4F {
                            break;
                        }
                    }
                }
                CaptionToken::Unknown
            }
            0x9B => self.control_sequence(reader)?,
            0x9D => {
                // TIME: two parameters
                reader.read_array_ref::<2>()?;
                CaptionToken::Unknown
            }
            // SPL STL and the undefined C1 positions
            _ => CaptionToken::Unknown,
        }))
    }

    /// CSI: accumulate parameter bytes until a final byte in 0x40..=0x7E arrives.
    fn control_sequence(&mut self, reader: &mut SliceReader) -> Result<CaptionToken> {
        let mut raw = String::new();
        loop {
            let b = reader.read_u8()?;
            raw.push((b & 0x7F) as char);
            if (0x40..=0x7E).contains(&b) {
                break;
            }
        }
        Ok(CaptionToken::Csi { raw })
    }
}

/// Decodes a two-byte kanji plane code via its EUC-JP representation.
fn decode_kanji(first: u8, second: u8) -> String {
    let euc = [first | 0x80, second | 0x80];
    let (text, _, had_errors) = EUC_JP.decode(&euc);
    if had_errors {
        GETA.to_string()
    } else {
        text.into_owned()
    }
}

/// Maps the ASCII repertoire onto the full-width forms used for captions.
fn fullwidth_alphanumeric(code: u8) -> char {
    char::from_u32(0xFF01 + (code as u32 - 0x21)).unwrap_or(GETA)
}

/// ARIB hiragana set: JIS row 4 followed by repeat/prolong marks and corner punctuation.
fn hiragana(code: u8) -> char {
    match code {
        0x21..=0x73 => char::from_u32(0x3041 + (code as u32 - 0x21)).unwrap_or(GETA),
        0x77 => 'ゝ',
        0x78 => 'ゞ',
        0x79 => 'ー',
        0x7A => '。',
        0x7B => '「',
        0x7C => '」',
        0x7D => '、',
        0x7E => '・',
        _ => '　',
    }
}

/// ARIB katakana set: JIS row 5 followed by repeat/prolong marks and corner punctuation.
fn katakana(code: u8) -> char {
    match code {
        0x21..=0x76 => char::from_u32(0x30A1 + (code as u32 - 0x21)).unwrap_or(GETA),
        0x77 => 'ヽ',
        0x78 => 'ヾ',
        0x79 => 'ー',
        0x7A => '。',
        0x7B => '「',
        0x7C => '」',
        0x7D => '、',
        0x7E => '・',
        _ => '　',
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arib::drcs::{DrcsCharacter, DrcsDataUnit, DrcsFont};

    fn decode(body: &[u8]) -> Vec<CaptionToken> {
        let table = DrcsTable::default();
        StatementDecoder::new(&table).decode(body).unwrap()
    }

    fn chars(tokens: &[CaptionToken]) -> String {
        tokens
            .iter()
            .filter_map(|t| match t {
                CaptionToken::Char { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn kanji_is_default_gl_set() {
        let tokens = decode(&[0x30, 0x21]);
        assert_eq!(
            tokens,
            [CaptionToken::Char {
                kind: CharKind::Kanji,
                text: "亜".to_string(),
            }]
        );
    }

    #[test]
    fn hiragana_is_default_gr_set() {
        let tokens = decode(&[0xA2]);
        assert_eq!(
            tokens,
            [CaptionToken::Char {
                kind: CharKind::Hiragana,
                text: "あ".to_string(),
            }]
        );
    }

    #[test]
    fn locking_shift_reaches_alphanumeric() {
        let tokens = decode(&[0x0E, 0x41, 0x42, 0x43]);
        assert_eq!(chars(&tokens), "ＡＢＣ");
        assert!(tokens
            .iter()
            .all(|t| matches!(t, CaptionToken::Char { kind: CharKind::Alphanumeric, .. })));
    }

    #[test]
    fn designation_escape_remaps_g0() {
        // ESC 0x28 0x31 puts katakana in G0
        let tokens = decode(&[0x1B, 0x28, 0x31, 0x21]);
        assert_eq!(
            tokens,
            [CaptionToken::Char {
                kind: CharKind::Katakana,
                text: "ァ".to_string(),
            }]
        );
    }

    #[test]
    fn single_shift_applies_to_one_character() {
        let tokens = decode(&[0x19, 0x21, 0x30, 0x21]);
        assert_eq!(
            tokens,
            [
                CaptionToken::Char {
                    kind: CharKind::Hiragana,
                    text: "ぁ".to_string(),
                },
                CaptionToken::Char {
                    kind: CharKind::Kanji,
                    text: "亜".to_string(),
                },
            ]
        );
    }

    #[test]
    fn control_characters_produce_tokens() {
        let tokens = decode(&[0x1C, 0x45, 0x4B, 0x20, 0x0C]);
        assert_eq!(
            tokens,
            [
                CaptionToken::Aps { row: 5, col: 11 },
                CaptionToken::Space,
                CaptionToken::ClearScreen,
            ]
        );
    }

    #[test]
    fn color_and_size_controls() {
        let tokens = decode(&[0x80, 0x88, 0x89, 0x8A]);
        assert_eq!(
            tokens,
            [
                CaptionToken::Color(CaptionColor::Black),
                CaptionToken::SmallSize,
                CaptionToken::MediumSize,
                CaptionToken::NormalSize,
            ]
        );
    }

    #[test]
    fn csi_accumulates_until_final_byte() {
        let mut body = vec![0x9B];
        body.extend_from_slice(b"170;389 a");
        let tokens = decode(&body);
        assert_eq!(
            tokens,
            [CaptionToken::Csi {
                raw: "170;389 a".to_string(),
            }]
        );
    }

    #[test]
    fn parameterized_controls_are_consumed_as_unknown() {
        // SZX with its parameter, then a kanji
        let tokens = decode(&[0x8B, 0x60, 0x30, 0x21]);
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0], CaptionToken::Unknown);
        assert_eq!(chars(&tokens), "亜");
    }

    #[test]
    fn drcs_without_definition_renders_replacement() {
        // Designate DRCS-1 into G1, shift GL there, reference code 0x21
        let table = DrcsTable::default();
        let tokens = StatementDecoder::new(&table)
            .decode(&[0x1B, 0x29, 0x20, 0x41, 0x0E, 0x21])
            .unwrap();
        assert_eq!(
            tokens,
            [CaptionToken::Char {
                kind: CharKind::Drcs,
                text: DRCS_REPLACEMENT.to_string(),
            }]
        );
    }

    #[test]
    fn recognized_drcs_glyph_substitutes_text() {
        let mut table = DrcsTable::default();
        table.register(&DrcsDataUnit {
            characters: vec![DrcsCharacter {
                character_code: 0x4121,
                fonts: vec![DrcsFont {
                    font_id: 0,
                    mode: 0,
                    depth: 2,
                    width: 36,
                    height: 36,
                    digest: 0,
                    substitute: Some("♬"),
                }],
            }],
        });
        let tokens = StatementDecoder::new(&table)
            .decode(&[0x1B, 0x29, 0x20, 0x41, 0x0E, 0x21])
            .unwrap();
        assert_eq!(
            tokens,
            [CaptionToken::Char {
                kind: CharKind::Drcs,
                text: "♬".to_string(),
            }]
        );
    }

    #[test]
    fn truncated_statement_is_an_overrun() {
        let table = DrcsTable::default();
        let err = StatementDecoder::new(&table).decode(&[0x30]).unwrap_err();
        assert!(matches!(err.details, ErrorDetails::PacketOverrun(_)));
    }
}
