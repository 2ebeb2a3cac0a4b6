//! Formatting of caption tokens into an Advanced SubStation Alpha subtitle file.
//!
//! The formatter mirrors a receiver's display model just closely enough to place text: it
//! keeps per-line buffers with inline ASS overrides and flushes them as timed `Dialogue`
//! events whenever the stream clears the screen.

use crate::arib::decoder::CaptionToken;
use log::info;
use regex::Regex;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// ASS play resolution width.
const PLAY_RES_X: u32 = 960;
/// ASS play resolution height.
const PLAY_RES_Y: u32 = 540;

const WHITE_OVERRIDE: &str = "{\\c&Hffffff&}";

/// Screen position in pixels.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Pos {
    pub x: u32,
    pub y: u32,
}

/// Width and height of an area in pixels.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

/// Character size selected by the SSZ/MSZ/NSZ controls.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TextSize {
    Small,
    Medium,
    Normal,
}

/// The caption plane geometry for horizontal standard-density captions.
#[derive(Debug)]
pub struct CaptionArea {
    upper_left: Pos,
    character_dim: Size,
    char_spacing: u32,
    line_spacing: u32,
}

impl Default for CaptionArea {
    fn default() -> Self {
        Self {
            upper_left: Pos { x: 170, y: 30 },
            character_dim: Size {
                width: 36,
                height: 36,
            },
            char_spacing: 4,
            line_spacing: 24,
        }
    }
}

impl CaptionArea {
    /// Pixel position of a character cell.
    ///
    /// ARIB rows count from the lower left while ASS positions name the upper left, hence
    /// the one-row adjustment. Medium text halves the cell width; small text halves both
    /// dimensions.
    pub fn row_col_to_pos(&self, row: u8, col: u8, size: TextSize) -> Pos {
        let mut w = self.character_dim.width + self.char_spacing;
        let mut h = self.character_dim.height + self.line_spacing;
        if size == TextSize::Small {
            h /= 2;
        }
        if size == TextSize::Small || size == TextSize::Medium {
            w /= 2;
        }
        Pos {
            x: self.upper_left.x + col as u32 * w,
            y: self.upper_left.y + (row as u32 + 1) * h,
        }
    }
}

/// Formats elapsed seconds as an ASS timestamp, e.g. `0:02:14.53`.
pub fn asstime(seconds: f64) -> String {
    let hrs = (seconds / 3600.0) as u32;
    let seconds = seconds - 3600.0 * hrs as f64;
    let mins = (seconds / 60.0) as u32;
    let seconds = seconds - 60.0 * mins as f64;
    format!("{}:{:02}:{:05.2}", hrs, mins, seconds)
}

/// A single open `.ass` file with its header sections already written.
struct AssFile {
    w: Box<dyn Write>,
}

impl AssFile {
    fn new(mut w: Box<dyn Write>, title: &str) -> io::Result<Self> {
        write!(
            w,
            "[Script Info]\n\
             ; Script generated by ts2ass\n\
             Title: Japanese Closed Captions\n\
             ScriptType: v4.00+\n\
             WrapStyle: 0\n\
             PlayResX: {PLAY_RES_X}\n\
             PlayResY: {PLAY_RES_Y}\n\
             ScaledBorderAndShadow: yes\n\
             Video Aspect Ratio: 0\n\
             Video Zoom: 1\n\
             Video Position: 0\n\
             Video File: {title}\n\
             \n\
             \n"
        )?;
        w.write_all(
            b"[V4+ Styles]\n\
              Format: Name, Fontname, Fontsize, PrimaryColour, SecondaryColour, OutlineColour, BackColour, Bold, Italic, Underline, StrikeOut, ScaleX, ScaleY, Spacing, Angle, BorderStyle, Outline, Shadow, Alignment, MarginL, MarginR, MarginV, Encoding\n\
              Style: normal,MS UI Gothic,37,&H00FFFFFF,&H000000FF,&H00000000,&H88000000,0,0,0,0,100,100,0,0,1,2,2,1,10,10,10,0\n\
              Style: medium,MS UI Gothic,37,&H00FFFFFF,&H000000FF,&H00000000,&H88000000,0,0,0,0,50,100,0,0,1,2,2,1,10,10,10,0\n\
              Style: small,MS UI Gothic,18,&H00FFFFFF,&H000000FF,&H00000000,&H88000000,0,0,0,0,100,100,0,0,1,2,2,1,10,10,10,0\n\
              \n\
              \n\
              [Events]\n\
              Format: Layer, Start, End, Style, Name, MarginL, MarginR, MarginV, Effect, Text\n",
        )?;
        Ok(Self { w })
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.w.write_all(line.as_bytes())
    }
}

/// Factory for the formatter's output; called once, on the first visible token.
pub type AssSinkOpener = Box<dyn FnMut() -> io::Result<Box<dyn Write>>>;

/// Stateful consumer of caption tokens producing timed ASS dialogue events.
///
/// Line buffers accumulate between clear-screen controls; each Aps or positioning control
/// sequence opens a new buffer with positioning overrides, and the clear screen flushes all
/// nonempty buffers with the time span since the previous flush.
pub struct AssFormatter {
    tmax: f64,
    area: CaptionArea,
    title: String,
    opener: AssSinkOpener,
    ass_file: Option<AssFile>,
    current_lines: Vec<String>,
    current_style: &'static str,
    current_color: &'static str,
    current_textsize: TextSize,
    start_time_s: f64,
    pos_re: Regex,
}

impl AssFormatter {
    pub fn new(tmax: u32, title: String, opener: AssSinkOpener) -> Self {
        Self {
            tmax: tmax as f64,
            area: CaptionArea::default(),
            title,
            opener,
            ass_file: None,
            current_lines: vec![String::new()],
            current_style: "normal",
            current_color: WHITE_OVERRIDE,
            current_textsize: TextSize::Normal,
            start_time_s: 0.0,
            pos_re: Regex::new(r"^(\d{1,4});(\d{1,4}) a$").unwrap(),
        }
    }

    /// Formatter writing to `path`, created lazily on the first visible token.
    pub fn to_path(tmax: u32, path: &Path) -> Self {
        let title = path.display().to_string();
        let path = path.to_path_buf();
        Self::new(
            tmax,
            title,
            Box::new(move || {
                File::create(&path).map(|f| Box::new(BufWriter::new(f)) as Box<dyn Write>)
            }),
        )
    }

    /// True once dialogue output has been opened.
    pub fn file_written(&self) -> bool {
        self.ass_file.is_some()
    }

    fn open_file(&mut self) -> io::Result<()> {
        if self.ass_file.is_none() {
            info!("found nonempty closed caption data; writing {}", self.title);
            let sink = (self.opener)()?;
            self.ass_file = Some(AssFile::new(sink, &self.title)?);
        }
        Ok(())
    }

    fn active_line(&mut self) -> &mut String {
        // current_lines is never empty
        self.current_lines.last_mut().unwrap()
    }

    fn push_line(&mut self, prefix: String) {
        self.current_lines.push(prefix);
    }

    fn set_size(&mut self, style: &'static str, size: TextSize) -> io::Result<()> {
        self.open_file()?;
        let reset = format!("{{\\r{}}}{}", style, self.current_color);
        self.active_line().push_str(&reset);
        self.current_style = style;
        self.current_textsize = size;
        Ok(())
    }

    /// Consumes one statement's tokens at the given elapsed stream time.
    pub fn format(&mut self, tokens: &[CaptionToken], timestamp: f64) -> io::Result<()> {
        for token in tokens {
            match token {
                CaptionToken::Char { text, .. } => {
                    self.open_file()?;
                    self.active_line().push_str(text);
                }
                CaptionToken::Space => {
                    self.open_file()?;
                    self.active_line().push(' ');
                }
                CaptionToken::NormalSize => self.set_size("normal", TextSize::Normal)?,
                CaptionToken::MediumSize => self.set_size("medium", TextSize::Medium)?,
                CaptionToken::SmallSize => self.set_size("small", TextSize::Small)?,
                CaptionToken::Color(color) => {
                    self.open_file()?;
                    let over = color.ass_override();
                    self.active_line().push_str(over);
                    self.current_color = over;
                }
                CaptionToken::Aps { row, col } => {
                    let pos = self.area.row_col_to_pos(*row, *col, self.current_textsize);
                    let line = format!(
                        "{{\\r{}}}{}{{\\pos({},{})}}",
                        self.current_style, self.current_color, pos.x, pos.y
                    );
                    self.push_line(line);
                }
                CaptionToken::Csi { raw } => {
                    // Active coordinate position set gives the lower left corner of the
                    // text, hence the bottom-left alignment override. Other finals
                    // (area and spacing configuration) are ignored.
                    if let Some(caps) = self.pos_re.captures(raw) {
                        let line = format!(
                            "{{\\r{}}}{}{{\\pos({},{})}}{{\\an1}}",
                            self.current_style,
                            self.current_color,
                            &caps[1],
                            &caps[2]
                        );
                        self.push_line(line);
                    }
                }
                CaptionToken::ClearScreen => self.clear_screen(timestamp)?,
                CaptionToken::Col | CaptionToken::Unknown => {}
            }
        }
        Ok(())
    }

    fn clear_screen(&mut self, timestamp: f64) -> io::Result<()> {
        let end_s = if timestamp - self.start_time_s > self.tmax {
            self.start_time_s + self.tmax
        } else {
            timestamp
        };
        let start_time = asstime(self.start_time_s);
        let end_time = asstime(end_s);

        if start_time != end_time && self.current_lines.iter().any(|line| !line.is_empty()) {
            for line in self.current_lines.iter().rev().filter(|line| !line.is_empty()) {
                if let Some(file) = &mut self.ass_file {
                    file.write_line(&format!(
                        "Dialogue: 0,{},{},normal,,0000,0000,0000,,{}\\N\n",
                        start_time, end_time, line
                    ))?;
                }
            }
            self.current_lines = vec![String::new()];
        }

        self.start_time_s = timestamp;
        self.current_textsize = TextSize::Normal;
        self.current_color = WHITE_OVERRIDE;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arib::decoder::{CaptionColor, CharKind};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl SharedBuf {
        fn contents(&self) -> String {
            String::from_utf8(self.0.borrow().clone()).unwrap()
        }

        fn dialogue_lines(&self) -> Vec<String> {
            self.contents()
                .lines()
                .filter(|l| l.starts_with("Dialogue:"))
                .map(str::to_string)
                .collect()
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

    fn memory_formatter(tmax: u32) -> (AssFormatter, SharedBuf) {
        let buf = SharedBuf::default();
        let sink = buf.clone();
        let formatter = AssFormatter::new(
            tmax,
            "test.ass".to_string(),
            Box::new(move || Ok(Box::new(sink.clone()) as Box<dyn Write>)),
        );
        (formatter, buf)
    }

    fn ch(text: &str) -> CaptionToken {
        CaptionToken::Char {
            kind: CharKind::Alphanumeric,
            text: text.to_string(),
        }
    }

    #[test]
    fn asstime_formats_padded_fields() {
        assert_eq!(asstime(0.0), "0:00:00.00");
        assert_eq!(asstime(3723.45), "1:02:03.45");
        assert_eq!(asstime(59.5), "0:00:59.50");
    }

    #[test]
    fn area_positions_follow_cell_geometry() {
        let area = CaptionArea::default();
        for row in 0..8 {
            for col in 0..16 {
                let normal = area.row_col_to_pos(row, col, TextSize::Normal);
                assert_eq!(normal.x, 170 + col as u32 * 40);
                assert_eq!(normal.y, 30 + (row as u32 + 1) * 60);
                let medium = area.row_col_to_pos(row, col, TextSize::Medium);
                assert_eq!(medium.x, 170 + col as u32 * 20);
                assert_eq!(medium.y, normal.y);
                let small = area.row_col_to_pos(row, col, TextSize::Small);
                assert_eq!(small.x, medium.x);
                assert_eq!(small.y, 30 + (row as u32 + 1) * 30);
            }
        }
    }

    #[test]
    fn clear_screen_emits_one_dialogue() {
        let (mut formatter, buf) = memory_formatter(5);
        formatter
            .format(&[ch("A"), ch("B"), ch("C")], 0.0)
            .unwrap();
        formatter.format(&[CaptionToken::ClearScreen], 1.0).unwrap();

        let dialogues = buf.dialogue_lines();
        assert_eq!(dialogues.len(), 1);
        assert!(dialogues[0].starts_with("Dialogue: 0,0:00:00.00,0:00:01.00,normal,"));
        assert!(dialogues[0].contains("ABC"));
        assert!(dialogues[0].ends_with("\\N"));
    }

    #[test]
    fn display_time_is_capped_at_tmax() {
        let (mut formatter, buf) = memory_formatter(5);
        formatter.format(&[ch("A")], 0.0).unwrap();
        formatter.format(&[CaptionToken::ClearScreen], 10.0).unwrap();

        let dialogues = buf.dialogue_lines();
        assert_eq!(dialogues.len(), 1);
        assert!(dialogues[0].starts_with("Dialogue: 0,0:00:00.00,0:00:05.00,normal,"));
    }

    #[test]
    fn position_sequence_sets_bottom_left_alignment() {
        let (mut formatter, buf) = memory_formatter(5);
        formatter
            .format(
                &[
                    CaptionToken::Csi {
                        raw: "170;389 a".to_string(),
                    },
                    ch("X"),
                ],
                0.0,
            )
            .unwrap();
        formatter.format(&[CaptionToken::ClearScreen], 2.0).unwrap();

        let dialogues = buf.dialogue_lines();
        assert_eq!(dialogues.len(), 1);
        assert!(dialogues[0].contains("{\\rnormal}{\\c&Hffffff&}{\\pos(170,389)}{\\an1}X"));
    }

    #[test]
    fn color_override_persists_across_position_sets() {
        let (mut formatter, buf) = memory_formatter(5);
        formatter
            .format(
                &[
                    CaptionToken::Color(CaptionColor::Black),
                    ch("Y"),
                    CaptionToken::Aps { row: 0, col: 0 },
                    ch("Z"),
                ],
                0.0,
            )
            .unwrap();
        formatter.format(&[CaptionToken::ClearScreen], 1.0).unwrap();

        let dialogues = buf.dialogue_lines();
        assert_eq!(dialogues.len(), 2);
        // Buffers are flushed in reverse order
        assert!(dialogues[0].contains("{\\rnormal}{\\c&H000000&}{\\pos(170,90)}Z"));
        assert!(dialogues[1].contains("{\\c&H000000&}Y"));
    }

    #[test]
    fn size_change_resets_style_with_current_color() {
        let (mut formatter, buf) = memory_formatter(5);
        formatter
            .format(&[CaptionToken::SmallSize, ch("S")], 0.0)
            .unwrap();
        formatter.format(&[CaptionToken::ClearScreen], 1.0).unwrap();

        let dialogues = buf.dialogue_lines();
        assert!(dialogues[0].contains("{\\rsmall}{\\c&Hffffff&}S"));
    }

    #[test]
    fn no_visible_tokens_leaves_file_unwritten() {
        let (mut formatter, buf) = memory_formatter(5);
        formatter
            .format(&[CaptionToken::Aps { row: 1, col: 1 }], 0.0)
            .unwrap();
        formatter.format(&[CaptionToken::ClearScreen], 1.0).unwrap();

        assert!(!formatter.file_written());
        assert!(buf.contents().is_empty());
    }

    #[test]
    fn zero_length_display_is_suppressed() {
        let (mut formatter, buf) = memory_formatter(5);
        formatter.format(&[ch("A")], 2.0).unwrap();
        // Clear screen with no elapsed time since the last flush boundary
        formatter.format(&[CaptionToken::ClearScreen], 0.0).unwrap();
        assert_eq!(buf.dialogue_lines().len(), 0);

        // The buffers survive and flush on the next clear screen
        formatter.format(&[CaptionToken::ClearScreen], 1.5).unwrap();
        let dialogues = buf.dialogue_lines();
        assert_eq!(dialogues.len(), 1);
        assert!(dialogues[0].contains('A'));
    }

    #[test]
    fn header_sections_written_once() {
        let (mut formatter, buf) = memory_formatter(5);
        formatter.format(&[ch("A")], 0.0).unwrap();
        formatter.format(&[CaptionToken::ClearScreen], 1.0).unwrap();
        formatter.format(&[ch("B")], 1.0).unwrap();
        formatter.format(&[CaptionToken::ClearScreen], 2.0).unwrap();

        let contents = buf.contents();
        assert_eq!(contents.matches("[Script Info]").count(), 1);
        assert_eq!(contents.matches("[V4+ Styles]").count(), 1);
        assert_eq!(contents.matches("Style: normal,MS UI Gothic,37,").count(), 1);
        assert_eq!(contents.matches("Style: medium,MS UI Gothic,37,").count(), 1);
        assert_eq!(contents.matches("Style: small,MS UI Gothic,18,").count(), 1);
        assert_eq!(buf.dialogue_lines().len(), 2);
    }
}
