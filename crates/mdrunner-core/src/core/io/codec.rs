use super::fio::{Encoding, FieldKind, FieldValue, FioError, Precision};
use nalgebra::Vector3;
use std::collections::VecDeque;
use std::io::{self, BufRead, Read, Write};
use std::path::PathBuf;

/// Per-call settings a backend needs from the owning file.
#[derive(Debug, Clone, Copy)]
pub struct CodecOptions<'a> {
    pub precision: Precision,
    pub debug: bool,
    pub comment: Option<&'a str>,
}

/// Defines how single fields are encoded on disk.
///
/// A backend is stateless apart from read-ahead buffering; the order of fields is
/// entirely the caller's business.
pub trait FieldCodec: Send {
    /// Encodes one field.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be represented in this encoding or the
    /// underlying writer fails.
    fn write_field(
        &mut self,
        out: &mut dyn Write,
        value: &FieldValue,
        options: &CodecOptions<'_>,
    ) -> Result<(), FioError>;

    /// Decodes one field of `kind`, with `count` elements for list kinds.
    ///
    /// # Errors
    ///
    /// Returns an error on premature end of input, on malformed data, or if the
    /// underlying reader fails.
    fn read_field(
        &mut self,
        input: &mut dyn BufRead,
        kind: FieldKind,
        count: usize,
        options: &CodecOptions<'_>,
    ) -> Result<FieldValue, FioError>;

    /// Drops any read-ahead state; called after the stream position changes.
    fn reset(&mut self) {}
}

pub fn for_encoding(encoding: Encoding) -> Box<dyn FieldCodec> {
    match encoding {
        Encoding::Text => Box::new(TextCodec::default()),
        Encoding::Raw => Box::new(RawCodec),
        Encoding::Portable => Box::new(PortableCodec),
    }
}

fn io_error(source: io::Error) -> FioError {
    FioError::Io {
        path: PathBuf::new(),
        source,
    }
}

fn eof_or_io(kind: FieldKind) -> impl Fn(io::Error) -> FioError {
    move |e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            FioError::UnexpectedEof(kind)
        } else {
            io_error(e)
        }
    }
}

/// Replaces whitespace so a string survives whitespace tokenization.
pub fn encode_string(s: &str) -> String {
    s.chars()
        .map(|c| if c == ' ' || c == '\t' { '_' } else { c })
        .collect()
}

pub fn decode_string(s: &str) -> String {
    s.replace('_', " ")
}

#[derive(Debug, Default)]
pub struct TextCodec {
    tokens: VecDeque<String>,
}

impl TextCodec {
    fn suffix(kind: FieldKind, options: &CodecOptions<'_>) -> String {
        if options.debug {
            format!("  ; {} {}", options.comment.unwrap_or(""), kind)
        } else {
            String::new()
        }
    }

    /// Returns the next whitespace-separated token, skipping everything after a `;`.
    fn next_token(
        &mut self,
        input: &mut dyn BufRead,
        kind: FieldKind,
    ) -> Result<String, FioError> {
        loop {
            if let Some(token) = self.tokens.pop_front() {
                return Ok(token);
            }
            let mut line = String::new();
            let read = input.read_line(&mut line).map_err(io_error)?;
            if read == 0 {
                return Err(FioError::UnexpectedEof(kind));
            }
            let content = line.split(';').next().unwrap_or("");
            self.tokens
                .extend(content.split_whitespace().map(str::to_string));
        }
    }

    fn parse<T: std::str::FromStr>(
        &mut self,
        input: &mut dyn BufRead,
        kind: FieldKind,
    ) -> Result<T, FioError> {
        let token = self.next_token(input, kind)?;
        token.parse().map_err(|_| FioError::Parse { kind, token })
    }

    fn parse_rvec(&mut self, input: &mut dyn BufRead) -> Result<Vector3<f64>, FioError> {
        let x = self.parse(input, FieldKind::RVec)?;
        let y = self.parse(input, FieldKind::RVec)?;
        let z = self.parse(input, FieldKind::RVec)?;
        Ok(Vector3::new(x, y, z))
    }
}

impl FieldCodec for TextCodec {
    fn write_field(
        &mut self,
        out: &mut dyn Write,
        value: &FieldValue,
        options: &CodecOptions<'_>,
    ) -> Result<(), FioError> {
        let suffix = Self::suffix(value.kind(), options);
        let result = match value {
            FieldValue::Real(v) => writeln!(out, "{:18.10e}{}", v, suffix),
            FieldValue::Int(v) => writeln!(out, "{:18}{}", v, suffix),
            FieldValue::UShort(v) => writeln!(out, "{:18}{}", v, suffix),
            FieldValue::UChars(bytes) => {
                let line: String = bytes.iter().map(|b| format!("{:4}", b)).collect();
                writeln!(out, "{}{}", line, suffix)
            }
            FieldValue::RVec(v) => {
                writeln!(out, "{:18.10e}{:18.10e}{:18.10e}{}", v.x, v.y, v.z, suffix)
            }
            FieldValue::NRVec(vectors) => vectors.iter().try_for_each(|v| {
                writeln!(out, "{:18.10e}{:18.10e}{:18.10e}{}", v.x, v.y, v.z, suffix)
            }),
            FieldValue::IVec(v) => writeln!(out, "{:18}{:18}{:18}{}", v[0], v[1], v[2], suffix),
            FieldValue::String(s) => {
                if s.is_empty() {
                    return Err(FioError::Format(
                        "empty strings cannot be stored in a text record file".to_string(),
                    ));
                }
                writeln!(out, "{:<18}{}", encode_string(s), suffix)
            }
        };
        result.map_err(io_error)
    }

    fn read_field(
        &mut self,
        input: &mut dyn BufRead,
        kind: FieldKind,
        count: usize,
        _options: &CodecOptions<'_>,
    ) -> Result<FieldValue, FioError> {
        Ok(match kind {
            FieldKind::Real => FieldValue::Real(self.parse(input, kind)?),
            FieldKind::Int => FieldValue::Int(self.parse(input, kind)?),
            FieldKind::UShort => FieldValue::UShort(self.parse(input, kind)?),
            FieldKind::UChars => FieldValue::UChars(
                (0..count)
                    .map(|_| self.parse::<u8>(input, kind))
                    .collect::<Result<_, _>>()?,
            ),
            FieldKind::RVec => FieldValue::RVec(self.parse_rvec(input)?),
            FieldKind::NRVec => FieldValue::NRVec(
                (0..count)
                    .map(|_| self.parse_rvec(input))
                    .collect::<Result<_, _>>()?,
            ),
            FieldKind::IVec => FieldValue::IVec([
                self.parse(input, kind)?,
                self.parse(input, kind)?,
                self.parse(input, kind)?,
            ]),
            FieldKind::String => {
                let token = self.next_token(input, kind)?;
                FieldValue::String(decode_string(&token))
            }
        })
    }

    fn reset(&mut self) {
        self.tokens.clear();
    }
}

fn read_array<const N: usize>(input: &mut dyn BufRead, kind: FieldKind) -> Result<[u8; N], FioError> {
    let mut buf = [0u8; N];
    input.read_exact(&mut buf).map_err(eof_or_io(kind))?;
    Ok(buf)
}

/// Fixed-size little-endian records. Strings are an `int` length that includes a
/// terminating NUL, followed by the bytes and the NUL.
#[derive(Debug, Default)]
pub struct RawCodec;

impl RawCodec {
    fn write_real(out: &mut dyn Write, v: f64, precision: Precision) -> io::Result<()> {
        match precision {
            Precision::Single => out.write_all(&(v as f32).to_le_bytes()),
            Precision::Double => out.write_all(&v.to_le_bytes()),
        }
    }

    fn read_real(input: &mut dyn BufRead, kind: FieldKind, precision: Precision) -> Result<f64, FioError> {
        Ok(match precision {
            Precision::Single => f32::from_le_bytes(read_array::<4>(input, kind)?) as f64,
            Precision::Double => f64::from_le_bytes(read_array::<8>(input, kind)?),
        })
    }

    fn read_int(input: &mut dyn BufRead, kind: FieldKind) -> Result<i32, FioError> {
        Ok(i32::from_le_bytes(read_array::<4>(input, kind)?))
    }

    fn read_rvec(input: &mut dyn BufRead, precision: Precision) -> Result<Vector3<f64>, FioError> {
        let kind = FieldKind::RVec;
        Ok(Vector3::new(
            Self::read_real(input, kind, precision)?,
            Self::read_real(input, kind, precision)?,
            Self::read_real(input, kind, precision)?,
        ))
    }
}

impl FieldCodec for RawCodec {
    fn write_field(
        &mut self,
        out: &mut dyn Write,
        value: &FieldValue,
        options: &CodecOptions<'_>,
    ) -> Result<(), FioError> {
        let p = options.precision;
        let result = match value {
            FieldValue::Real(v) => Self::write_real(out, *v, p),
            FieldValue::Int(v) => out.write_all(&v.to_le_bytes()),
            FieldValue::UShort(v) => out.write_all(&v.to_le_bytes()),
            FieldValue::UChars(bytes) => out.write_all(bytes),
            FieldValue::RVec(v) => v.iter().try_for_each(|c| Self::write_real(out, *c, p)),
            FieldValue::NRVec(vectors) => vectors
                .iter()
                .flat_map(|v| v.iter())
                .try_for_each(|c| Self::write_real(out, *c, p)),
            FieldValue::IVec(v) => v.iter().try_for_each(|c| out.write_all(&c.to_le_bytes())),
            FieldValue::String(s) => {
                let len = i32::try_from(s.len() + 1)
                    .map_err(|_| FioError::Format(format!("string of {} bytes is too long", s.len())))?;
                out.write_all(&len.to_le_bytes())
                    .and_then(|_| out.write_all(s.as_bytes()))
                    .and_then(|_| out.write_all(&[0]))
            }
        };
        result.map_err(io_error)
    }

    fn read_field(
        &mut self,
        input: &mut dyn BufRead,
        kind: FieldKind,
        count: usize,
        options: &CodecOptions<'_>,
    ) -> Result<FieldValue, FioError> {
        let p = options.precision;
        Ok(match kind {
            FieldKind::Real => FieldValue::Real(Self::read_real(input, kind, p)?),
            FieldKind::Int => FieldValue::Int(Self::read_int(input, kind)?),
            FieldKind::UShort => FieldValue::UShort(u16::from_le_bytes(read_array::<2>(input, kind)?)),
            FieldKind::UChars => {
                let mut bytes = vec![0u8; count];
                input.read_exact(&mut bytes).map_err(eof_or_io(kind))?;
                FieldValue::UChars(bytes)
            }
            FieldKind::RVec => FieldValue::RVec(Self::read_rvec(input, p)?),
            FieldKind::NRVec => FieldValue::NRVec(
                (0..count)
                    .map(|_| Self::read_rvec(input, p))
                    .collect::<Result<_, _>>()?,
            ),
            FieldKind::IVec => FieldValue::IVec([
                Self::read_int(input, kind)?,
                Self::read_int(input, kind)?,
                Self::read_int(input, kind)?,
            ]),
            FieldKind::String => {
                let len = Self::read_int(input, kind)?;
                let len = usize::try_from(len)
                    .ok()
                    .filter(|l| *l >= 1)
                    .ok_or_else(|| FioError::Format(format!("invalid string length {}", len)))?;
                let mut bytes = vec![0u8; len];
                input.read_exact(&mut bytes).map_err(eof_or_io(kind))?;
                bytes.pop();
                FieldValue::String(
                    String::from_utf8(bytes)
                        .map_err(|e| FioError::Format(format!("string is not UTF-8: {}", e)))?,
                )
            }
        })
    }
}

/// Portable big-endian records in the XDR layout: every item occupies a multiple of
/// four bytes, so single bytes and shorts are widened to four.
#[derive(Debug, Default)]
pub struct PortableCodec;

impl PortableCodec {
    fn write_real(out: &mut dyn Write, v: f64, precision: Precision) -> io::Result<()> {
        match precision {
            Precision::Single => out.write_all(&(v as f32).to_be_bytes()),
            Precision::Double => out.write_all(&v.to_be_bytes()),
        }
    }

    fn read_real(input: &mut dyn BufRead, kind: FieldKind, precision: Precision) -> Result<f64, FioError> {
        Ok(match precision {
            Precision::Single => f32::from_be_bytes(read_array::<4>(input, kind)?) as f64,
            Precision::Double => f64::from_be_bytes(read_array::<8>(input, kind)?),
        })
    }

    fn read_word(input: &mut dyn BufRead, kind: FieldKind) -> Result<u32, FioError> {
        Ok(u32::from_be_bytes(read_array::<4>(input, kind)?))
    }

    fn read_rvec(input: &mut dyn BufRead, precision: Precision) -> Result<Vector3<f64>, FioError> {
        let kind = FieldKind::RVec;
        Ok(Vector3::new(
            Self::read_real(input, kind, precision)?,
            Self::read_real(input, kind, precision)?,
            Self::read_real(input, kind, precision)?,
        ))
    }

    fn padding(len: usize) -> usize {
        (4 - len % 4) % 4
    }
}

impl FieldCodec for PortableCodec {
    fn write_field(
        &mut self,
        out: &mut dyn Write,
        value: &FieldValue,
        options: &CodecOptions<'_>,
    ) -> Result<(), FioError> {
        let p = options.precision;
        let result = match value {
            FieldValue::Real(v) => Self::write_real(out, *v, p),
            FieldValue::Int(v) => out.write_all(&v.to_be_bytes()),
            FieldValue::UShort(v) => out.write_all(&u32::from(*v).to_be_bytes()),
            FieldValue::UChars(bytes) => bytes
                .iter()
                .try_for_each(|b| out.write_all(&u32::from(*b).to_be_bytes())),
            FieldValue::RVec(v) => v.iter().try_for_each(|c| Self::write_real(out, *c, p)),
            FieldValue::NRVec(vectors) => vectors
                .iter()
                .flat_map(|v| v.iter())
                .try_for_each(|c| Self::write_real(out, *c, p)),
            FieldValue::IVec(v) => v.iter().try_for_each(|c| out.write_all(&c.to_be_bytes())),
            FieldValue::String(s) => {
                let len = u32::try_from(s.len())
                    .ok()
                    .filter(|l| *l < i32::MAX as u32)
                    .ok_or_else(|| FioError::Format(format!("string of {} bytes is too long", s.len())))?;
                let with_nul = (len + 1).to_be_bytes();
                out.write_all(&with_nul)
                    .and_then(|_| out.write_all(&len.to_be_bytes()))
                    .and_then(|_| out.write_all(s.as_bytes()))
                    .and_then(|_| out.write_all(&[0u8; 3][..Self::padding(s.len())]))
            }
        };
        result.map_err(io_error)
    }

    fn read_field(
        &mut self,
        input: &mut dyn BufRead,
        kind: FieldKind,
        count: usize,
        options: &CodecOptions<'_>,
    ) -> Result<FieldValue, FioError> {
        let p = options.precision;
        Ok(match kind {
            FieldKind::Real => FieldValue::Real(Self::read_real(input, kind, p)?),
            FieldKind::Int => FieldValue::Int(Self::read_word(input, kind)? as i32),
            FieldKind::UShort => {
                let word = Self::read_word(input, kind)?;
                FieldValue::UShort(u16::try_from(word).map_err(|_| FioError::Parse {
                    kind,
                    token: word.to_string(),
                })?)
            }
            FieldKind::UChars => FieldValue::UChars(
                (0..count)
                    .map(|_| {
                        let word = Self::read_word(input, kind)?;
                        u8::try_from(word).map_err(|_| FioError::Parse {
                            kind,
                            token: word.to_string(),
                        })
                    })
                    .collect::<Result<_, _>>()?,
            ),
            FieldKind::RVec => FieldValue::RVec(Self::read_rvec(input, p)?),
            FieldKind::NRVec => FieldValue::NRVec(
                (0..count)
                    .map(|_| Self::read_rvec(input, p))
                    .collect::<Result<_, _>>()?,
            ),
            FieldKind::IVec => FieldValue::IVec([
                Self::read_word(input, kind)? as i32,
                Self::read_word(input, kind)? as i32,
                Self::read_word(input, kind)? as i32,
            ]),
            FieldKind::String => {
                let with_nul = Self::read_word(input, kind)? as usize;
                let len = Self::read_word(input, kind)? as usize;
                if with_nul != len + 1 {
                    return Err(FioError::Format(format!(
                        "string length {} does not match declared size {}",
                        len, with_nul
                    )));
                }
                let mut bytes = vec![0u8; len + Self::padding(len)];
                input.read_exact(&mut bytes).map_err(eof_or_io(kind))?;
                bytes.truncate(len);
                FieldValue::String(
                    String::from_utf8(bytes)
                        .map_err(|e| FioError::Format(format!("string is not UTF-8: {}", e)))?,
                )
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn options() -> CodecOptions<'static> {
        CodecOptions {
            precision: Precision::Double,
            debug: false,
            comment: None,
        }
    }

    #[test]
    fn string_escaping_swaps_whitespace_and_underscores() {
        assert_eq!(encode_string("a b\tc"), "a_b_c");
        assert_eq!(decode_string("a_b_c"), "a b c");
    }

    #[test]
    fn text_reader_skips_comments_and_splits_lines() {
        let mut codec = TextCodec::default();
        let mut input = Cursor::new("; header comment\n  1  2 ; trailing\n3\n");
        let read_int = |codec: &mut TextCodec, input: &mut Cursor<&str>| match codec
            .read_field(input, FieldKind::Int, 1, &options())
            .unwrap()
        {
            FieldValue::Int(v) => v,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(read_int(&mut codec, &mut input), 1);
        assert_eq!(read_int(&mut codec, &mut input), 2);
        assert_eq!(read_int(&mut codec, &mut input), 3);
    }

    #[test]
    fn text_writer_uses_fixed_width_scientific_reals() {
        let mut codec = TextCodec::default();
        let mut out = Vec::new();
        codec
            .write_field(&mut out, &FieldValue::Real(1.5), &options())
            .unwrap();
        let line = String::from_utf8(out).unwrap();
        assert_eq!(line.trim_end_matches('\n').len(), 18);
        assert_eq!(line.trim().parse::<f64>().unwrap(), 1.5);
    }

    #[test]
    fn text_debug_mode_appends_comment() {
        let mut codec = TextCodec::default();
        let mut out = Vec::new();
        let opts = CodecOptions {
            precision: Precision::Double,
            debug: true,
            comment: Some("natoms"),
        };
        codec
            .write_field(&mut out, &FieldValue::Int(5), &opts)
            .unwrap();
        let line = String::from_utf8(out).unwrap();
        assert!(line.contains("; natoms INT"));

        let mut reader = Cursor::new(line);
        assert_eq!(
            codec
                .read_field(&mut reader, FieldKind::Int, 1, &options())
                .unwrap(),
            FieldValue::Int(5)
        );
    }

    #[test]
    fn text_parse_failure_reports_token() {
        let mut codec = TextCodec::default();
        let mut input = Cursor::new("abc\n");
        let err = codec
            .read_field(&mut input, FieldKind::Real, 1, &options())
            .unwrap_err();
        assert!(matches!(err, FioError::Parse { kind: FieldKind::Real, ref token } if token == "abc"));
    }

    #[test]
    fn raw_strings_carry_length_with_terminator() {
        let mut out = Vec::new();
        RawCodec
            .write_field(&mut out, &FieldValue::String("ab".into()), &options())
            .unwrap();
        assert_eq!(out, vec![3, 0, 0, 0, b'a', b'b', 0]);
    }

    #[test]
    fn portable_strings_are_padded_to_words() {
        let mut out = Vec::new();
        PortableCodec
            .write_field(&mut out, &FieldValue::String("abcde".into()), &options())
            .unwrap();
        assert_eq!(&out[..8], &[0, 0, 0, 6, 0, 0, 0, 5]);
        assert_eq!(&out[8..13], b"abcde");
        assert_eq!(out.len(), 16);

        let mut input = Cursor::new(out);
        assert_eq!(
            PortableCodec
                .read_field(&mut input, FieldKind::String, 1, &options())
                .unwrap(),
            FieldValue::String("abcde".into())
        );
    }

    #[test]
    fn portable_widens_bytes_and_shorts() {
        let mut out = Vec::new();
        PortableCodec
            .write_field(&mut out, &FieldValue::UChars(vec![7, 8]), &options())
            .unwrap();
        PortableCodec
            .write_field(&mut out, &FieldValue::UShort(513), &options())
            .unwrap();
        assert_eq!(out, vec![0, 0, 0, 7, 0, 0, 0, 8, 0, 0, 2, 1]);
    }

    #[test]
    fn truncated_binary_input_is_reported_as_eof() {
        let mut input = Cursor::new(vec![0u8, 0]);
        let err = PortableCodec
            .read_field(&mut input, FieldKind::Int, 1, &options())
            .unwrap_err();
        assert!(matches!(err, FioError::UnexpectedEof(FieldKind::Int)));
    }
}
