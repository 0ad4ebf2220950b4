// =========================
// parse.rs
// MilterEngine 同梱フィルタ（メールデコード・ログ出力）
//
// 【このファイルで使う主なクレート】
// - mail_parser: MIMEメールのパース・構造化・本文抽出・添付抽出（MessageParser, MimeHeaders）
// - async-trait: Milterトレイト実装
// - crate::printdaytimeln!: タイムスタンプ付きログ出力マクロ
//
// 【役割】
// - DecoderMilter: 本文チャンクを溜め、本文終了時にメール全体をパースしてログ出力
// - From/To/Subject/パート構成/添付ファイル情報の要約（MailSummary）
// - ヘッダ追加が交渉済みなら X-Milter-Decoder ヘッダを付けて受理
// =========================

use async_trait::async_trait;
use mail_parser::{Address, MessageParser, MimeHeaders, PartType}; // メールパース・MIMEヘッダアクセス用

use crate::context::{Context, HeaderList};
use crate::error::MilterError;
use crate::handler::Milter;
use crate::milter::AddressFamily;
use crate::milter_command::ActionFlags;
use crate::response::Response;

/// 付与するヘッダ名
pub const DECODER_HEADER: &str = "X-Milter-Decoder";

/// 添付ファイル等の非テキストパート情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentInfo {
    pub content_type: String, // 例: application/pdf
    pub encoding: String,     // 例: Base64
    pub filename: String,     // Content-Disposition の filename、無ければ Content-Type の name
    pub size: usize,          // デコード後のバイト数
}

/// メール1通の要約
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailSummary {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub multipart: bool,
    pub text_parts: usize, // text/plain, text/html 等の本文パート数
    pub attachments: Vec<AttachmentInfo>,
}

impl MailSummary {
    /// X-Milter-Decoder ヘッダの値
    pub fn header_value(&self) -> String {
        format!(
            "parsed; text_parts={}; attachments={}",
            self.text_parts,
            self.attachments.len()
        )
    }
}

/// 受信ヘッダ（受信順）と本文からRFC 5322形式のメール全体を組み立てる
///
/// 本文の改行はCRLFに統一する。
pub fn build_raw_message(headers: &HeaderList, body: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(body.len() + headers.len() * 64 + 2);
    for (name, value) in headers.iter() {
        raw.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes()); // RFC準拠のCRLF改行
    }
    raw.extend_from_slice(b"\r\n"); // ヘッダ部とボディ部の区切り空行
    let mut prev = 0u8;
    for &b in body {
        if b == b'\n' && prev != b'\r' {
            raw.push(b'\r');
        }
        raw.push(b);
        prev = b;
    }
    raw
}

// アドレス一覧を "名前 <addr>, addr" 形式に
fn format_addresses(addrs: Option<&Address<'_>>) -> String {
    addrs
        .map(|addrs| {
            addrs
                .iter()
                .map(|addr| {
                    let name = addr.name().unwrap_or(""); // 表示名
                    let address = addr.address().unwrap_or(""); // アドレス
                    if !name.is_empty() {
                        format!("{} <{}>", name, address)
                    } else {
                        address.to_string()
                    }
                })
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_else(|| "(なし)".to_string())
}

/// メール全体をパースして要約を作る（パース不能ならNone）
pub fn parse_mail(headers: &HeaderList, body: &[u8]) -> Option<MailSummary> {
    let raw = build_raw_message(headers, body);
    let msg = MessageParser::default().parse(&raw)?;

    let mut text_parts = 0;
    let mut attachments = Vec::new();
    for (i, part) in msg.parts.iter().enumerate() {
        match &part.body {
            // multipart/* は子パートの入れ物
            PartType::Multipart(_) => {}
            PartType::Text(_) | PartType::Html(_) => {
                text_parts += 1;
                crate::debugdaytimeln!(
                    "[mail-parser] 本文パート({}): {} bytes",
                    i + 1,
                    part.body.len()
                );
            }
            _ => {
                let content_type = part
                    .content_type()
                    .map(|ct| match ct.c_subtype.as_deref() {
                        Some(sub) => format!("{}/{}", ct.c_type, sub),
                        None => ct.c_type.to_string(),
                    })
                    .unwrap_or_else(|| "(不明)".to_string());
                // ファイル名は Content-Disposition の filename、古い形式は Content-Type の name
                let filename = part
                    .content_disposition()
                    .and_then(|cd| {
                        cd.attributes()
                            .unwrap_or(&[])
                            .iter()
                            .find(|attr| attr.name.eq_ignore_ascii_case("filename"))
                            .map(|attr| attr.value.to_string())
                    })
                    .or_else(|| {
                        part.content_type().and_then(|ct| {
                            ct.attributes()
                                .unwrap_or(&[])
                                .iter()
                                .find(|attr| attr.name.eq_ignore_ascii_case("name"))
                                .map(|attr| attr.value.to_string())
                        })
                    })
                    .unwrap_or_else(|| "(ファイル名なし)".to_string());
                attachments.push(AttachmentInfo {
                    content_type,
                    encoding: format!("{:?}", part.encoding),
                    filename,
                    size: part.body.len(),
                });
            }
        }
    }

    Some(MailSummary {
        from: format_addresses(msg.from()),
        to: format_addresses(msg.to()),
        subject: msg.subject().unwrap_or("(なし)").to_string(),
        multipart: msg.parts.len() > 1,
        text_parts,
        attachments,
    })
}

/// 本文終了時にメールをデコードしてログに出す同梱フィルタ
#[derive(Debug, Default)]
pub struct DecoderMilter {
    session_id: String,
    body: Vec<u8>, // 受信済み本文
}

impl DecoderMilter {
    pub fn new() -> Self {
        Self::default()
    }

    fn log_summary(&self, ctx: &Context, summary: &MailSummary) {
        let id = ctx.message_id().unwrap_or(&self.session_id);
        crate::printdaytimeln!("[{}] from: {}", id, summary.from);
        crate::printdaytimeln!("[{}] to: {}", id, summary.to);
        crate::printdaytimeln!("[{}] subject: {}", id, summary.subject);
        crate::printdaytimeln!(
            "[{}] {} テキストパート数: {} 非テキストパート数: {}",
            id,
            if summary.multipart { "マルチパート" } else { "シングルパート" },
            summary.text_parts,
            summary.attachments.len()
        );
        for (i, att) in summary.attachments.iter().enumerate() {
            crate::printdaytimeln!(
                "[{}] 非テキストパート({}): content_type={}, encoding={}, filename={}, size={} bytes",
                id,
                i + 1,
                att.content_type,
                att.encoding,
                att.filename,
                att.size
            );
        }
    }
}

#[async_trait]
impl Milter for DecoderMilter {
    async fn init(&mut self, session_id: &str, message_id: &str) {
        self.session_id = session_id.to_string();
        self.body.clear();
        if !message_id.is_empty() {
            crate::debugdaytimeln!("[{}] メッセージ開始: {}", session_id, message_id);
        }
    }

    async fn connect(
        &mut self,
        _ctx: &mut Context,
        host: &str,
        family: AddressFamily,
        port: u16,
        address: &str,
    ) -> Result<Response, MilterError> {
        crate::debugdaytimeln!("[{}] connect: {} {} {}:{}", self.session_id, host, family, address, port);
        Ok(Response::Continue)
    }

    async fn body_chunk(&mut self, _ctx: &mut Context, chunk: &[u8]) -> Result<Response, MilterError> {
        self.body.extend_from_slice(chunk);
        Ok(Response::Continue)
    }

    async fn body(&mut self, ctx: &mut Context) -> Result<Response, MilterError> {
        let body = std::mem::take(&mut self.body);
        match parse_mail(ctx.headers(), &body) {
            Some(summary) => {
                self.log_summary(ctx, &summary);
                if ctx.can(ActionFlags::ADD_HEADERS) {
                    ctx.add_header(DECODER_HEADER, &summary.header_value())?;
                }
            }
            None => crate::printdaytimeln!("[{}] [mail-parser] parse error", self.session_id),
        }
        Ok(Response::Accept)
    }

    async fn abort(&mut self, _ctx: &mut Context) {
        self.body.clear();
    }

    async fn disconnect(&mut self) {
        crate::debugdaytimeln!("[{}] disconnect", self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderList {
        let mut list = HeaderList::new();
        for (k, v) in pairs {
            list.push(k.to_string(), v.to_string());
        }
        list
    }

    #[test]
    fn raw_message_uses_crlf() {
        let raw = build_raw_message(&headers(&[("Subject", "Hi")]), b"a\nb\r\nc");
        assert_eq!(raw, b"Subject: Hi\r\n\r\na\r\nb\r\nc".to_vec());
    }

    #[test]
    fn single_part_summary() {
        let list = headers(&[
            ("From", "Alice <a@example.com>"),
            ("To", "b@example.com"),
            ("Subject", "Hi"),
        ]);
        let summary = parse_mail(&list, b"hello\r\n").unwrap();
        assert_eq!(summary.from, "Alice <a@example.com>");
        assert_eq!(summary.to, "b@example.com");
        assert_eq!(summary.subject, "Hi");
        assert!(!summary.multipart);
        assert_eq!(summary.text_parts, 1);
        assert!(summary.attachments.is_empty());
    }

    #[test]
    fn attachment_is_described() {
        let list = headers(&[
            ("From", "a@example.com"),
            ("Subject", "report"),
            ("MIME-Version", "1.0"),
            ("Content-Type", "multipart/mixed; boundary=\"XX\""),
        ]);
        let body = b"--XX\r\n\
Content-Type: text/plain\r\n\
\r\n\
see attached\r\n\
--XX\r\n\
Content-Type: application/pdf; name=\"r.pdf\"\r\n\
Content-Disposition: attachment; filename=\"r.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
SGVsbG8=\r\n\
--XX--\r\n";
        let summary = parse_mail(&list, body).unwrap();
        assert!(summary.multipart);
        assert_eq!(summary.text_parts, 1);
        assert_eq!(summary.attachments.len(), 1);
        let att = &summary.attachments[0];
        assert_eq!(att.filename, "r.pdf");
        assert_eq!(att.content_type, "application/pdf");
        assert_eq!(att.size, 5);
        assert_eq!(summary.header_value(), "parsed; text_parts=1; attachments=1");
    }

    #[tokio::test]
    async fn tags_message_when_allowed() {
        let mut milter = DecoderMilter::new();
        let mut ctx = Context::new("S1");
        ctx.headers.push("Subject".into(), "Hi".into());
        ctx.modifier.set_allowed(ActionFlags::ADD_HEADERS);
        ctx.modifier.open_window();
        milter.body_chunk(&mut ctx, b"hello").await.unwrap();
        let response = milter.body(&mut ctx).await.unwrap();
        assert_eq!(response, Response::Accept);
        let pending = ctx.modifier.close_window();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].as_str(), "add_header");
    }

    #[tokio::test]
    async fn skips_header_when_not_negotiated() {
        let mut milter = DecoderMilter::new();
        let mut ctx = Context::new("S1");
        ctx.modifier.open_window();
        let response = milter.body(&mut ctx).await.unwrap();
        assert_eq!(response, Response::Accept);
        assert!(ctx.modifier.close_window().is_empty());
    }
}
