// =========================
// error.rs
// MilterEngine エラー定義モジュール
//
// 【このファイルで使う主なクレート】
// - thiserror: エラー型のDisplay/From実装を自動生成
// - std: I/Oエラー（io::Error）、時間（Duration）
//
// 【役割】
// - Milterプロトコル処理中に発生するエラーを1つのenumに集約
// - デコード/順序/ネゴシエーション/誤用/通信/設定の各分類をErrorKindで判別
// =========================

use std::time::Duration;

use thiserror::Error;

/// エラー分類（致命的かどうかの判断・ログ出力に使う）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Decode,        // パケット・ペイロードの破損
    ProtocolOrder, // フェーズ外のコマンド受信
    Negotiation,   // OPTNEGの不一致
    Misuse,        // フィルタ側の使い方の誤り（修正アクションの時期違反など）
    Transport,     // 送受信エラー
    Closed,        // フィルタからのセッション終了要求
    Config,        // 設定ファイルの誤り
}

/// Milter処理全体で使うエラー型
#[derive(Debug, Error)]
pub enum MilterError {
    /// 長さプレフィックスまたはペイロードの途中で切断された
    #[error("パケット受信途中で切断: {expected} バイト中 {received} バイト")]
    ShortRead { expected: usize, received: usize },

    /// 長さ0のパケット（コマンドバイトすら無い）
    #[error("長さ0のパケットを受信")]
    ZeroLength,

    /// 上限を超えるパケット長
    #[error("パケット長 {len} が上限 {max} を超過")]
    Oversized { len: usize, max: usize },

    /// 未定義のコマンドバイト
    #[error("未定義コマンド: 0x{0:02X}")]
    UnknownCommand(u8),

    /// ペイロード構造の破損
    #[error("{command} ペイロード不正: {reason}")]
    MalformedPayload {
        command: &'static str,
        reason: String,
    },

    /// マクロ定義パケットが空、または名前/値が対になっていない
    #[error("macro definition with no data")]
    MacroNoData,

    /// 現在のフェーズで受け付けられないコマンド
    #[error("フェーズ {phase} でコマンド {command} は受信できない")]
    OutOfOrder {
        phase: &'static str,
        command: &'static str,
    },

    /// MTAのプロトコルバージョンが対応範囲外
    #[error("未対応のMilterプロトコルバージョン: {0}")]
    UnsupportedVersion(u32),

    /// フィルタが必要とするアクションをMTAが提供していない
    #[error("MTAが必要なアクションを提供していない: {missing}")]
    ActionNotOffered { missing: String },

    /// 修正アクションは本文終了後、最終応答前にしか送れない
    #[error("修正アクション {action} は本文終了後にしか使えない")]
    ModificationOutsideWindow { action: &'static str },

    /// ネゴシエーションで宣言していないアクション
    #[error("修正アクション {action} はネゴシエーションで宣言されていない")]
    ActionNotNegotiated { action: &'static str },

    /// REJECT/TEMPFAIL応答テキストの書式違反
    #[error("SMTP応答テキスト不正: {0}")]
    InvalidReply(String),

    /// 送受信エラー
    #[error("I/Oエラー: {0}")]
    Io(#[from] std::io::Error),

    /// 無通信タイムアウト
    #[error("タイムアウト ({0:?} 無通信)")]
    Timeout(Duration),

    /// フィルタが接続終了を要求した
    #[error("stop current milter processing")]
    CloseSession,

    /// 待受アドレス未指定
    #[error("no listen addr specified")]
    NoListenAddr,

    /// 設定ファイルの誤り
    #[error("設定エラー: {0}")]
    Config(String),
}

impl MilterError {
    /// エラー分類を返す
    pub fn kind(&self) -> ErrorKind {
        match self {
            MilterError::ShortRead { .. }
            | MilterError::ZeroLength
            | MilterError::Oversized { .. }
            | MilterError::UnknownCommand(_)
            | MilterError::MalformedPayload { .. }
            | MilterError::MacroNoData => ErrorKind::Decode,
            MilterError::OutOfOrder { .. } => ErrorKind::ProtocolOrder,
            MilterError::UnsupportedVersion(_) | MilterError::ActionNotOffered { .. } => {
                ErrorKind::Negotiation
            }
            MilterError::ModificationOutsideWindow { .. }
            | MilterError::ActionNotNegotiated { .. }
            | MilterError::InvalidReply(_) => ErrorKind::Misuse,
            MilterError::Io(_) | MilterError::Timeout(_) => ErrorKind::Transport,
            MilterError::CloseSession => ErrorKind::Closed,
            MilterError::NoListenAddr | MilterError::Config(_) => ErrorKind::Config,
        }
    }

    /// ペイロード破損エラーの簡易生成
    pub(crate) fn malformed(command: &'static str, reason: impl Into<String>) -> Self {
        MilterError::MalformedPayload {
            command,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(MilterError::MacroNoData.kind(), ErrorKind::Decode);
        assert_eq!(
            MilterError::OutOfOrder {
                phase: "Helo",
                command: "SMFIC_BODY"
            }
            .kind(),
            ErrorKind::ProtocolOrder
        );
        assert_eq!(MilterError::UnsupportedVersion(1).kind(), ErrorKind::Negotiation);
        assert_eq!(
            MilterError::ModificationOutsideWindow { action: "add_header" }.kind(),
            ErrorKind::Misuse
        );
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert_eq!(MilterError::from(io).kind(), ErrorKind::Transport);
        assert_eq!(MilterError::CloseSession.kind(), ErrorKind::Closed);
    }

    #[test]
    fn macro_no_data_message_is_stable() {
        assert_eq!(
            MilterError::MacroNoData.to_string(),
            "macro definition with no data"
        );
    }
}
