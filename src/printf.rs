//! A small `printf`-family formatter (C1).
//!
//! Rust has no C-style variadic functions, so callers build an explicit
//! slice of [`Arg`] values instead of a `va_list`; [`format`] consumes them
//! positionally as it walks the format string. The result is written into a
//! caller-provided buffer (never allocated), bounded by the buffer's length,
//! matching `vsnprintf`'s "never overrun, always report the would-be length"
//! contract.

/// One formatted argument. Argument *kind* still must match the conversion
/// specifier it's consumed by; there is no varargs promotion to paper over a
/// mismatch, so a `%d` consuming an `Arg::Str` prints a `{!}` placeholder
/// rather than reading the wrong union member.
#[derive(Clone, Copy)]
pub enum Arg<'a> {
    Signed(i64),
    Unsigned(u64),
    Str(&'a str),
    Char(u8),
    Ptr(usize),
}

struct Flags {
    left_align: bool,
    plus_sign: bool,
    space_sign: bool,
    alt_form: bool,
    zero_pad: bool,
}

/// Format `fmt` against `args`, writing into `buf`.
///
/// Returns the number of bytes that *would* have been written given
/// unlimited space (the `vsnprintf` convention), even though at most
/// `buf.len()` bytes are actually stored.
pub fn format(buf: &mut [u8], fmt: &str, args: &[Arg]) -> usize {
    let mut sink = Sink { buf, written: 0 };
    let mut arg_idx = 0usize;
    let bytes = fmt.as_bytes();
    let mut i = 0usize;

    while i < bytes.len() {
        let b = bytes[i];
        if b != b'%' {
            sink.push(b);
            i += 1;
            continue;
        }
        i += 1;
        if i >= bytes.len() {
            sink.push(b'%');
            break;
        }
        if bytes[i] == b'%' {
            sink.push(b'%');
            i += 1;
            continue;
        }

        let mut flags = Flags {
            left_align: false,
            plus_sign: false,
            space_sign: false,
            alt_form: false,
            zero_pad: false,
        };
        loop {
            match bytes.get(i) {
                Some(b'-') => flags.left_align = true,
                Some(b'+') => flags.plus_sign = true,
                Some(b' ') => flags.space_sign = true,
                Some(b'#') => flags.alt_form = true,
                Some(b'0') => flags.zero_pad = true,
                _ => break,
            }
            i += 1;
        }

        let mut width = 0usize;
        if bytes.get(i) == Some(&b'*') {
            width = next_width_arg(args, &mut arg_idx);
            i += 1;
        } else {
            while let Some(d) = bytes.get(i).copied() {
                if d.is_ascii_digit() {
                    width = width * 10 + (d - b'0') as usize;
                    i += 1;
                } else {
                    break;
                }
            }
        }

        let mut precision: Option<usize> = None;
        if bytes.get(i) == Some(&b'.') {
            i += 1;
            if bytes.get(i) == Some(&b'*') {
                precision = Some(next_width_arg(args, &mut arg_idx));
                i += 1;
            } else {
                let mut p = 0usize;
                while let Some(d) = bytes.get(i).copied() {
                    if d.is_ascii_digit() {
                        p = p * 10 + (d - b'0') as usize;
                        i += 1;
                    } else {
                        break;
                    }
                }
                precision = Some(p);
            }
        }

        // Length modifiers: parsed for conformance, but since arguments
        // already arrive as i64/u64/etc the width they'd otherwise imply is
        // a no-op here.
        for modifier in [b"hh", b"ll"] {
            if bytes[i..].starts_with(modifier) {
                i += 2;
            }
        }
        if matches!(bytes.get(i), Some(b'h') | Some(b'l') | Some(b'j') | Some(b'z') | Some(b't')) {
            i += 1;
        }

        let Some(&conv) = bytes.get(i) else { break };
        i += 1;

        let arg = args.get(arg_idx).copied();
        arg_idx += 1;

        emit_conversion(&mut sink, conv, &flags, width, precision, arg);
    }

    sink.written
}

fn next_width_arg(args: &[Arg], idx: &mut usize) -> usize {
    let v = match args.get(*idx) {
        Some(Arg::Signed(n)) => (*n).max(0) as usize,
        Some(Arg::Unsigned(n)) => *n as usize,
        _ => 0,
    };
    *idx += 1;
    v
}

fn emit_conversion(
    sink: &mut Sink,
    conv: u8,
    flags: &Flags,
    width: usize,
    precision: Option<usize>,
    arg: Option<Arg>,
) {
    match conv {
        b'd' | b'i' => {
            let n = match arg {
                Some(Arg::Signed(n)) => n,
                Some(Arg::Unsigned(n)) => n as i64,
                _ => return sink.push_str("{!}"),
            };
            write_integer(sink, flags, width, precision, n, 10, false, true);
        }
        b'u' => {
            let n = match arg {
                Some(Arg::Unsigned(n)) => n,
                Some(Arg::Signed(n)) => n as u64,
                _ => return sink.push_str("{!}"),
            };
            write_unsigned(sink, flags, width, precision, n, 10, false);
        }
        b'o' => {
            let n = unsigned_of(arg);
            match n {
                Some(n) => write_unsigned(sink, flags, width, precision, n, 8, false),
                None => sink.push_str("{!}"),
            }
        }
        b'x' => match unsigned_of(arg) {
            Some(n) => write_unsigned(sink, flags, width, precision, n, 16, false),
            None => sink.push_str("{!}"),
        },
        b'X' => match unsigned_of(arg) {
            Some(n) => write_unsigned(sink, flags, width, precision, n, 16, true),
            None => sink.push_str("{!}"),
        },
        b'c' => match arg {
            Some(Arg::Char(c)) => pad_and_push(sink, flags, width, &[c]),
            _ => sink.push_str("{!}"),
        },
        b's' => match arg {
            Some(Arg::Str(s)) => {
                let s = match precision {
                    Some(p) if p < s.len() => &s[..p],
                    _ => s,
                };
                pad_and_push(sink, flags, width, s.as_bytes())
            }
            _ => sink.push_str("{!}"),
        },
        b'p' => match arg {
            Some(Arg::Ptr(p)) => {
                sink.push_str("0x");
                write_unsigned(
                    sink,
                    &Flags {
                        left_align: false,
                        plus_sign: false,
                        space_sign: false,
                        alt_form: false,
                        zero_pad: true,
                    },
                    16,
                    None,
                    p as u64,
                    16,
                    false,
                );
            }
            _ => sink.push_str("{!}"),
        },
        b'n' => {
            // Recording the byte count so far into caller state isn't
            // expressible without raw pointers; callers that need %n should
            // read `format`'s return value instead.
        }
        _ => {
            sink.push(b'%');
            sink.push(conv);
        }
    }
}

fn unsigned_of(arg: Option<Arg>) -> Option<u64> {
    match arg {
        Some(Arg::Unsigned(n)) => Some(n),
        Some(Arg::Signed(n)) => Some(n as u64),
        _ => None,
    }
}

#[allow(clippy::too_many_arguments)]
fn write_integer(
    sink: &mut Sink,
    flags: &Flags,
    width: usize,
    precision: Option<usize>,
    n: i64,
    radix: u32,
    _upper: bool,
    signed: bool,
) {
    let negative = signed && n < 0;
    let mag = if negative { (n as i128).unsigned_abs() as u64 } else { n as u64 };
    let mut digits = [0u8; 32];
    let len = write_digits(&mut digits, mag, radix, false);
    let sign: &[u8] = if negative {
        b"-"
    } else if flags.plus_sign {
        b"+"
    } else if flags.space_sign {
        b" "
    } else {
        b""
    };

    let digit_str = &digits[32 - len..];
    let min_digits = precision.unwrap_or(0);
    let zero_fill = min_digits.saturating_sub(len);

    let total_len = sign.len() + zero_fill + len;
    let pad = width.saturating_sub(total_len);

    if !flags.left_align && flags.zero_pad && precision.is_none() {
        sink.push_bytes(sign);
        for _ in 0..pad {
            sink.push(b'0');
        }
        for _ in 0..zero_fill {
            sink.push(b'0');
        }
        sink.push_bytes(digit_str);
    } else if !flags.left_align {
        for _ in 0..pad {
            sink.push(b' ');
        }
        sink.push_bytes(sign);
        for _ in 0..zero_fill {
            sink.push(b'0');
        }
        sink.push_bytes(digit_str);
    } else {
        sink.push_bytes(sign);
        for _ in 0..zero_fill {
            sink.push(b'0');
        }
        sink.push_bytes(digit_str);
        for _ in 0..pad {
            sink.push(b' ');
        }
    }
}

fn write_unsigned(
    sink: &mut Sink,
    flags: &Flags,
    width: usize,
    precision: Option<usize>,
    n: u64,
    radix: u32,
    upper: bool,
) {
    let mut digits = [0u8; 32];
    let len = write_digits(&mut digits, n, radix, upper);
    let digit_str = &digits[32 - len..];
    let min_digits = precision.unwrap_or(0);
    let zero_fill = min_digits.saturating_sub(len);

    let prefix: &[u8] = if flags.alt_form && radix == 16 && n != 0 {
        if upper {
            b"0X"
        } else {
            b"0x"
        }
    } else {
        b""
    };

    let total_len = prefix.len() + zero_fill + len;
    let pad = width.saturating_sub(total_len);

    if !flags.left_align && flags.zero_pad && precision.is_none() {
        sink.push_bytes(prefix);
        for _ in 0..pad {
            sink.push(b'0');
        }
        for _ in 0..zero_fill {
            sink.push(b'0');
        }
        sink.push_bytes(digit_str);
    } else if !flags.left_align {
        for _ in 0..pad {
            sink.push(b' ');
        }
        sink.push_bytes(prefix);
        for _ in 0..zero_fill {
            sink.push(b'0');
        }
        sink.push_bytes(digit_str);
    } else {
        sink.push_bytes(prefix);
        for _ in 0..zero_fill {
            sink.push(b'0');
        }
        sink.push_bytes(digit_str);
        for _ in 0..pad {
            sink.push(b' ');
        }
    }
}

fn write_digits(out: &mut [u8; 32], mut n: u64, radix: u32, upper: bool) -> usize {
    let digits_lower = b"0123456789abcdef";
    let digits_upper = b"0123456789ABCDEF";
    let table = if upper { digits_upper } else { digits_lower };
    if n == 0 {
        out[31] = b'0';
        return 1;
    }
    let mut len = 0;
    while n > 0 {
        out[31 - len] = table[(n % radix as u64) as usize];
        n /= radix as u64;
        len += 1;
    }
    len
}

fn pad_and_push(sink: &mut Sink, flags: &Flags, width: usize, bytes: &[u8]) {
    let pad = width.saturating_sub(bytes.len());
    if flags.left_align {
        sink.push_bytes(bytes);
        for _ in 0..pad {
            sink.push(b' ');
        }
    } else {
        for _ in 0..pad {
            sink.push(b' ');
        }
        sink.push_bytes(bytes);
    }
}

struct Sink<'a> {
    buf: &'a mut [u8],
    written: usize,
}

impl Sink<'_> {
    fn push(&mut self, b: u8) {
        if self.written < self.buf.len() {
            self.buf[self.written] = b;
        }
        self.written += 1;
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.push(b);
        }
    }

    fn push_str(&mut self, s: &str) {
        self.push_bytes(s.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(f: &str, args: &[Arg]) -> (usize, alloc::string::String) {
        let mut buf = [0u8; 256];
        let n = format(&mut buf, f, args);
        let copied = n.min(buf.len());
        (n, core::str::from_utf8(&buf[..copied]).unwrap().into())
    }

    #[test]
    fn plain_text_passes_through() {
        let (n, s) = fmt("hello, world", &[]);
        assert_eq!(n, 12);
        assert_eq!(s, "hello, world");
    }

    #[test]
    fn decimal_and_sign_flags() {
        let (_, s) = fmt("%d %+d % d", &[Arg::Signed(5), Arg::Signed(5), Arg::Signed(5)]);
        assert_eq!(s, "5 +5  5");
        let (_, s) = fmt("%d", &[Arg::Signed(-7)]);
        assert_eq!(s, "-7");
    }

    #[test]
    fn hex_with_alt_form_and_width() {
        let (_, s) = fmt("%#x", &[Arg::Unsigned(255)]);
        assert_eq!(s, "0xff");
        let (_, s) = fmt("%08X", &[Arg::Unsigned(0xBEEF)]);
        assert_eq!(s, "0000BEEF");
    }

    #[test]
    fn string_and_char() {
        let (_, s) = fmt("%s/%c", &[Arg::Str("abc"), Arg::Char(b'!')]);
        assert_eq!(s, "abc/!");
        let (_, s) = fmt("%.2s", &[Arg::Str("abcdef")]);
        assert_eq!(s, "ab");
    }

    #[test]
    fn left_align_and_width_padding() {
        let (_, s) = fmt("[%-5d]", &[Arg::Signed(3)]);
        assert_eq!(s, "[3    ]");
        let (_, s) = fmt("[%5d]", &[Arg::Signed(3)]);
        assert_eq!(s, "[    3]");
    }

    #[test]
    fn pointer_conversion() {
        let (_, s) = fmt("%p", &[Arg::Ptr(0x1000)]);
        assert_eq!(s, "0x0000000000001000");
    }

    #[test]
    fn truncates_but_reports_full_length() {
        let mut buf = [0u8; 4];
        let n = format(&mut buf, "%d", &[Arg::Signed(123456)]);
        assert_eq!(n, 6);
        assert_eq!(&buf, b"1234");
    }

    #[test]
    fn star_width_from_args() {
        let (_, s) = fmt("[%*d]", &[Arg::Signed(4), Arg::Signed(9)]);
        assert_eq!(s, "[   9]");
    }

    #[test]
    fn octal_conversion() {
        let (_, s) = fmt("%o", &[Arg::Unsigned(8)]);
        assert_eq!(s, "10");
    }
}
