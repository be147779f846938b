use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while_m_n},
    character::complete::{char, digit1, hex_digit1, u8},
    combinator::{all_consuming, map, map_res, opt, value},
    multi::many1,
    sequence::{preceded, tuple},
    IResult,
};

/// One endpoint of a captured USB transfer, as Wireshark renders it in
/// `usb.src` / `usb.dst`: either the literal "host", or a
/// `bus.device.endpoint` triple such as "2.7.0".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbAddr {
    Host,
    Device { bus: u8, device: u8, endpoint: u8 },
}

pub fn usb_addr(input: &str) -> IResult<&str, UsbAddr> {
    alt((
        value(UsbAddr::Host, tag("host")),
        map(
            tuple((u8, char('.'), u8, char('.'), u8)),
            |(bus, _, device, _, endpoint)| UsbAddr::Device {
                bus,
                device,
                endpoint,
            },
        ),
    ))(input)
}

/// Hex byte string as found in `frame_raw` / `*_raw` fields. Wireshark
/// emits contiguous pairs ("0040ad00"), some dissection fields use colon
/// separators ("00:40:ad:00"); both are accepted.
pub fn hex_bytes(input: &str) -> IResult<&str, Vec<u8>> {
    many1(preceded(opt(char(':')), hex_pair))(input)
}

fn hex_pair(input: &str) -> IResult<&str, u8> {
    map_res(
        take_while_m_n(2, 2, |c: char| c.is_ascii_hexdigit()),
        |s: &str| u8::from_str_radix(s, 16),
    )(input)
}

/// Numeric field, decimal ("129") or 0x-prefixed hex ("0x81").
pub fn uint(input: &str) -> IResult<&str, u64> {
    alt((
        preceded(
            tag_no_case("0x"),
            map_res(hex_digit1, |s: &str| u64::from_str_radix(s, 16)),
        ),
        map_res(digit1, |s: &str| s.parse::<u64>()),
    ))(input)
}

/// Parse a whole string as a numeric field, tolerating surrounding
/// whitespace. Returns `None` on trailing garbage.
pub fn parse_uint(s: &str) -> Option<u64> {
    all_consuming(uint)(s.trim()).ok().map(|(_, v)| v)
}

pub fn parse_hex_bytes(s: &str) -> Option<Vec<u8>> {
    all_consuming(hex_bytes)(s.trim()).ok().map(|(_, v)| v)
}

pub fn parse_usb_addr(s: &str) -> Option<UsbAddr> {
    all_consuming(usb_addr)(s.trim()).ok().map(|(_, v)| v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usb_addr() {
        assert_eq!(usb_addr("host"), Ok(("", UsbAddr::Host)));
        assert_eq!(
            usb_addr("2.7.0"),
            Ok((
                "",
                UsbAddr::Device {
                    bus: 2,
                    device: 7,
                    endpoint: 0
                }
            ))
        );
        assert_eq!(
            usb_addr("1.255.2"),
            Ok((
                "",
                UsbAddr::Device {
                    bus: 1,
                    device: 255,
                    endpoint: 2
                }
            ))
        );
        assert!(usb_addr("spectrometer").is_err());
    }

    #[test]
    fn test_hex_bytes() {
        assert_eq!(hex_bytes("0040ad0000"), Ok(("", vec![0x00, 0x40, 0xad, 0x00, 0x00])));
        assert_eq!(hex_bytes("c0:01:00:00"), Ok(("", vec![0xc0, 0x01, 0x00, 0x00])));
        assert!(hex_bytes("zz").is_err());
    }

    #[test]
    fn test_hex_bytes_odd_length_leaves_rest() {
        // A trailing nibble is not a byte; it stays unconsumed.
        assert_eq!(hex_bytes("0040a"), Ok(("a", vec![0x00, 0x40])));
    }

    #[test]
    fn test_uint() {
        assert_eq!(uint("129"), Ok(("", 129)));
        assert_eq!(uint("0x81"), Ok(("", 0x81)));
        assert_eq!(uint("0xAD"), Ok(("", 0xad)));
    }

    #[test]
    fn test_parse_uint() {
        assert_eq!(parse_uint(" 0x02 "), Some(2));
        assert_eq!(parse_uint("7"), Some(7));
        assert_eq!(parse_uint("7 bytes"), None);
    }
}
