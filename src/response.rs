// =========================
// response.rs
// MilterEngine 応答（決定）定義と応答パケット生成
//
// 【このファイルで使う主なクレート】
// - crate::milter_command: 応答バイト（ReplyCode）
// - crate::packet: Packet
//
// 【役割】
// - Response: コールバックが返す決定（CONTINUE/ACCEPT/REJECT/TEMPFAIL/DISCARD）
// - encode_decision: 決定を1つの応答パケットへ変換（SMTP応答テキスト付きはSMFIR_REPLYCODE）
// =========================

use crate::error::MilterError;
use crate::milter_command::ReplyCode;
use crate::packet::Packet;

/// コールバックの決定
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// 処理継続
    Continue,
    /// メッセージ受理（以降のフィルタ処理を省略）
    Accept,
    /// 拒否（応答テキスト指定時は "550 5.7.1 ..." 形式）
    Reject(Option<String>),
    /// 一時エラー（応答テキスト指定時は "451 4.7.1 ..." 形式）
    TempFail(Option<String>),
    /// 黙って破棄
    Discard,
}

impl Response {
    /// 応答テキスト無しのREJECT
    pub fn reject() -> Self {
        Response::Reject(None)
    }

    /// SMTP応答テキスト付きREJECT（例: "550 5.7.1 blocked"）
    pub fn reject_with(reply: impl Into<String>) -> Self {
        Response::Reject(Some(reply.into()))
    }

    pub fn tempfail() -> Self {
        Response::TempFail(None)
    }

    /// SMTP応答テキスト付きTEMPFAIL（例: "451 4.3.0 try later"）
    pub fn tempfail_with(reply: impl Into<String>) -> Self {
        Response::TempFail(Some(reply.into()))
    }

    /// メッセージの処理を打ち切る決定か（CONTINUE以外）
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Response::Continue)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Response::Continue => "CONTINUE",
            Response::Accept => "ACCEPT",
            Response::Reject(_) => "REJECT",
            Response::TempFail(_) => "TEMPFAIL",
            Response::Discard => "DISCARD",
        }
    }
}

/// 決定を応答パケットへ変換
///
/// REJECT/TEMPFAILに応答テキストがある場合はSMFIR_REPLYCODE('y')で送る。
/// 応答コードの先頭桁が決定と合わない（REJECTに4xx等）場合は `InvalidReply`。
pub fn encode_decision(response: &Response) -> Result<Packet, MilterError> {
    let packet = match response {
        Response::Continue => Packet::empty(ReplyCode::Continue.as_u8()),
        Response::Accept => Packet::empty(ReplyCode::Accept.as_u8()),
        Response::Discard => Packet::empty(ReplyCode::Discard.as_u8()),
        Response::Reject(None) => Packet::empty(ReplyCode::Reject.as_u8()),
        Response::TempFail(None) => Packet::empty(ReplyCode::TempFail.as_u8()),
        Response::Reject(Some(text)) => reply_code_packet(text, b'5')?,
        Response::TempFail(Some(text)) => reply_code_packet(text, b'4')?,
    };
    Ok(packet)
}

// "<3桁コード> <テキスト>" を検証してSMFIR_REPLYCODEを組み立てる
fn reply_code_packet(text: &str, class: u8) -> Result<Packet, MilterError> {
    let bytes = text.as_bytes();
    let valid_code = bytes.len() >= 3
        && bytes[0] == class
        && bytes[1].is_ascii_digit()
        && bytes[2].is_ascii_digit()
        && (bytes.len() == 3 || bytes[3] == b' ' || bytes[3] == b'-');
    if !valid_code {
        return Err(MilterError::InvalidReply(format!(
            "応答コードは {}xx で始まる必要がある: {:?}",
            class as char, text
        )));
    }
    if bytes.contains(&0) {
        return Err(MilterError::InvalidReply("応答テキストにNULを含む".to_string()));
    }
    let mut payload = Vec::with_capacity(bytes.len() + 1);
    payload.extend_from_slice(bytes);
    payload.push(0);
    Ok(Packet::new(ReplyCode::ReplyCode.as_u8(), payload))
}
