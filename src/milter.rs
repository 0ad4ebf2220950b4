// =========================
// milter.rs
// MilterEngine Milterコマンドごとのペイロード分解モジュール
//
// 【このファイルで使う主なクレート】
// - std: バイト操作（split, from_be_bytes）、文字列変換（from_utf8_lossy）
// - crate::error: MilterError（ペイロード破損）
//
// 【役割】
// - NUL終端文字列列の分解
// - CONNECT / HELO / MAIL / RCPT / HEADER / UNKNOWN の各ペイロードを構造体へ変換
// =========================

use std::fmt;

use crate::error::MilterError;

/// CONNECTコマンドのアドレスファミリ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Unknown, // 'U': 不明（以降のポート・アドレス無し）
    Unix,    // 'L': UNIXドメインソケット
    Inet,    // '4': IPv4
    Inet6,   // '6': IPv6
}

impl AddressFamily {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            b'U' => Some(AddressFamily::Unknown),
            b'L' => Some(AddressFamily::Unix),
            b'4' => Some(AddressFamily::Inet),
            b'6' => Some(AddressFamily::Inet6),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            AddressFamily::Unknown => b'U',
            AddressFamily::Unix => b'L',
            AddressFamily::Inet => b'4',
            AddressFamily::Inet6 => b'6',
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AddressFamily::Unknown => "unknown",
            AddressFamily::Unix => "unix",
            AddressFamily::Inet => "tcp4",
            AddressFamily::Inet6 => "tcp6",
        };
        f.write_str(name)
    }
}

/// SMFIC_CONNECTペイロードの分解結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectInfo {
    pub host: String,          // 接続元ホスト名
    pub family: AddressFamily, // アドレスファミリ
    pub port: u16,             // 接続元ポート（UNIX/不明時は0）
    pub address: String,       // IPアドレスまたはソケットパス
}

impl ConnectInfo {
    /// IPv4/IPv6の場合にアドレスをIpAddrとして取得
    pub fn ip(&self) -> Option<std::net::IpAddr> {
        match self.family {
            AddressFamily::Inet | AddressFamily::Inet6 => {
                // IPv6は "IPv6:" 接頭辞付きで届くことがある（Sendmail）
                let raw = self.address.strip_prefix("IPv6:").unwrap_or(&self.address);
                raw.parse().ok()
            }
            _ => None,
        }
    }
}

/// MAIL FROM / RCPT TO ペイロード（アドレス + ESMTP引数）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub address: String,   // 角括弧付きのまま（例: <a@example.com>）
    pub args: Vec<String>, // ESMTP引数（例: SIZE=1024）
}

/// NUL終端文字列の並びを分解する
///
/// 末尾のNULを1つ取り除いてからNULで分割する。空ペイロードは要素0個。
/// 最後の要素がNUL終端されていない場合もそのまま1要素として扱う。
pub fn split_cstrings(data: &[u8]) -> Vec<String> {
    if data.is_empty() {
        return Vec::new();
    }
    let trimmed = data.strip_suffix(&[0u8]).unwrap_or(data);
    trimmed
        .split(|b| *b == 0x00)
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}

// NUL終端文字列を1つ読み、残りを返す
fn take_cstring<'a>(
    data: &'a [u8],
    command: &'static str,
    field: &str,
) -> Result<(String, &'a [u8]), MilterError> {
    let end = data
        .iter()
        .position(|b| *b == 0x00)
        .ok_or_else(|| MilterError::malformed(command, format!("{} がNUL終端されていない", field)))?;
    let value = String::from_utf8_lossy(&data[..end]).into_owned();
    Ok((value, &data[end + 1..]))
}

/// SMFIC_CONNECTペイロードを分解
///
/// 形式: ホスト名\0 + ファミリ(1) + [ポート(2, BE) + アドレス\0]
pub fn decode_connect(payload: &[u8]) -> Result<ConnectInfo, MilterError> {
    const CMD: &str = "SMFIC_CONNECT";
    let (host, rest) = take_cstring(payload, CMD, "ホスト名")?;
    let (&family_byte, rest) = rest
        .split_first()
        .ok_or_else(|| MilterError::malformed(CMD, "アドレスファミリが無い"))?;
    let family = AddressFamily::from_u8(family_byte).ok_or_else(|| {
        MilterError::malformed(CMD, format!("未定義のアドレスファミリ 0x{:02X}", family_byte))
    })?;
    if family == AddressFamily::Unknown {
        // 不明ファミリはポート・アドレスを持たない
        return Ok(ConnectInfo {
            host,
            family,
            port: 0,
            address: String::new(),
        });
    }
    if rest.len() < 2 {
        return Err(MilterError::malformed(CMD, "ポート番号が無い"));
    }
    let port = u16::from_be_bytes([rest[0], rest[1]]);
    let (address, _) = take_cstring(&rest[2..], CMD, "アドレス")?;
    Ok(ConnectInfo {
        host,
        family,
        port,
        address,
    })
}

/// SMFIC_HELOペイロードを分解（HELO名）
pub fn decode_helo(payload: &[u8]) -> Result<String, MilterError> {
    split_cstrings(payload)
        .into_iter()
        .next()
        .ok_or_else(|| MilterError::malformed("SMFIC_HELO", "HELO名が無い"))
}

/// SMFIC_MAIL / SMFIC_RCPT ペイロードを分解
pub fn decode_envelope(command: &'static str, payload: &[u8]) -> Result<Envelope, MilterError> {
    let mut parts = split_cstrings(payload).into_iter();
    let address = parts
        .next()
        .ok_or_else(|| MilterError::malformed(command, "アドレスが無い"))?;
    Ok(Envelope {
        address,
        args: parts.collect(),
    })
}

/// SMFIC_HEADERペイロードを分解（ヘッダ名, 値）
///
/// 値が空のヘッダも有効。名前と値の2要素でなければ破損扱い。
pub fn decode_header(payload: &[u8]) -> Result<(String, String), MilterError> {
    const CMD: &str = "SMFIC_HEADER";
    let (name, rest) = take_cstring(payload, CMD, "ヘッダ名")?;
    if name.is_empty() {
        return Err(MilterError::malformed(CMD, "ヘッダ名が空"));
    }
    let (value, rest) = take_cstring(rest, CMD, "ヘッダ値")?;
    if !rest.is_empty() {
        return Err(MilterError::malformed(CMD, "ヘッダ値の後に余分なデータ"));
    }
    Ok((name, value))
}

/// SMFIC_UNKNOWNペイロード（SMTPコマンド行そのもの）
pub fn decode_unknown(payload: &[u8]) -> String {
    split_cstrings(payload).into_iter().next().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect_payload(host: &str, family: u8, port: u16, addr: &str) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(host.as_bytes());
        p.push(0);
        p.push(family);
        p.extend_from_slice(&port.to_be_bytes());
        p.extend_from_slice(addr.as_bytes());
        p.push(0);
        p
    }

    #[test]
    fn connect_ipv4() {
        let info = decode_connect(&connect_payload("mail.example.com", b'4', 25, "203.0.113.5")).unwrap();
        assert_eq!(info.host, "mail.example.com");
        assert_eq!(info.family, AddressFamily::Inet);
        assert_eq!(info.port, 25);
        assert_eq!(info.address, "203.0.113.5");
        assert_eq!(info.ip(), Some("203.0.113.5".parse().unwrap()));
    }

    #[test]
    fn connect_ipv6_with_prefix() {
        let info = decode_connect(&connect_payload("h", b'6', 587, "IPv6:2001:db8::1")).unwrap();
        assert_eq!(info.ip(), Some("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn connect_unknown_family_has_no_address() {
        let info = decode_connect(b"localhost\0U").unwrap();
        assert_eq!(info.family, AddressFamily::Unknown);
        assert_eq!(info.port, 0);
        assert!(info.address.is_empty());
    }

    #[test]
    fn connect_rejects_truncated_payloads() {
        assert!(decode_connect(b"no-nul").is_err());
        assert!(decode_connect(b"host\0").is_err());
        assert!(decode_connect(b"host\0X\0\0").is_err());
        assert!(decode_connect(b"host\x004\0").is_err());
    }

    #[test]
    fn envelope_keeps_brackets_and_args() {
        let env = decode_envelope("SMFIC_MAIL", b"<a@example.com>\0SIZE=1024\0BODY=8BITMIME\0").unwrap();
        assert_eq!(env.address, "<a@example.com>");
        assert_eq!(env.args, vec!["SIZE=1024", "BODY=8BITMIME"]);
        assert!(decode_envelope("SMFIC_RCPT", b"").is_err());
    }

    #[test]
    fn header_name_and_value() {
        assert_eq!(
            decode_header(b"Subject\0Hi\0").unwrap(),
            ("Subject".to_string(), "Hi".to_string())
        );
        assert_eq!(
            decode_header(b"X-Empty\0\0").unwrap(),
            ("X-Empty".to_string(), String::new())
        );
        assert!(decode_header(b"Subject\0").is_err());
        assert!(decode_header(b"\0value\0").is_err());
    }

    #[test]
    fn cstrings_split() {
        assert!(split_cstrings(b"").is_empty());
        assert_eq!(split_cstrings(b"i\0\0"), vec!["i", ""]);
        assert_eq!(split_cstrings(b"a\0b"), vec!["a", "b"]);
    }
}
