// =========================
// negotiate.rs
// MilterEngine オプション交渉（SMFIC_OPTNEG）モジュール
//
// 【このファイルで使う主なクレート】
// - std: バイト操作（from_be_bytes / to_be_bytes）
// - crate::milter_command: ActionFlags / ProtocolFlags / MilterCommand
// - crate::printdaytimeln!: タイムスタンプ付きログ出力マクロ
//
// 【役割】
// - OPTNEGペイロード（バージョン + アクションフラグ + プロトコルフラグ）の分解・組み立て
// - MTAの提供機能とフィルタの要求を突き合わせ、接続中固定のFeatureMaskを導出
// =========================

use crate::error::MilterError;
use crate::milter_command::{ActionFlags, MilterCommand, ProtocolFlags, ReplyCode};
use crate::packet::Packet;

/// このフィルタが話すMilterプロトコルの最大バージョン
pub const MILTER_VERSION: u32 = 6;
/// 受け入れる最小バージョン
pub const MIN_MILTER_VERSION: u32 = 2;

/// OPTNEGペイロード（12バイト: バージョン + アクション + プロトコル）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptNeg {
    pub version: u32,
    pub actions: ActionFlags,
    pub protocol: ProtocolFlags,
}

impl OptNeg {
    /// OPTNEGペイロードを分解（12バイト未満は破損扱い）
    pub fn parse(payload: &[u8]) -> Result<Self, MilterError> {
        if payload.len() < 12 {
            return Err(MilterError::malformed(
                "SMFIC_OPTNEG",
                format!("ペイロード長不足: {} bytes", payload.len()),
            ));
        }
        // 4バイトごとに各値を抽出（13バイト目以降は将来拡張として無視）
        let word = |i: usize| {
            u32::from_be_bytes([payload[i], payload[i + 1], payload[i + 2], payload[i + 3]])
        };
        Ok(OptNeg {
            version: word(0),
            actions: ActionFlags::from_bits(word(4)),
            protocol: ProtocolFlags::from_bits(word(8)),
        })
    }

    /// OPTNEG応答パケットを生成
    pub fn to_packet(&self) -> Packet {
        let mut payload = Vec::with_capacity(12);
        payload.extend_from_slice(&self.version.to_be_bytes());
        payload.extend_from_slice(&self.actions.bits().to_be_bytes());
        payload.extend_from_slice(&self.protocol.bits().to_be_bytes());
        Packet::new(ReplyCode::OptNeg.as_u8(), payload)
    }
}

/// 決定済み応答の後に届いたパケットの扱い
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainPolicy {
    /// 応答せずに読み捨てる（MTAはもう応答を待っていない前提）
    Silent,
    /// 応答が必要なパケットには同じ決定を再送する
    Repeat,
}

impl DrainPolicy {
    /// 交渉済みバージョンから既定の扱いを決める
    ///
    /// v6未満のMTAは決定応答を受けた時点でメッセージを打ち切るため、
    /// 後続パケットに応答すると応答の順序がずれる。
    pub fn for_version(version: u32) -> Self {
        if version >= 6 {
            DrainPolicy::Repeat
        } else {
            DrainPolicy::Silent
        }
    }

    pub fn from_name(name: &str) -> Option<Option<Self>> {
        match name.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(None),
            "silent" => Some(Some(DrainPolicy::Silent)),
            "repeat" => Some(Some(DrainPolicy::Repeat)),
            _ => None,
        }
    }
}

/// 交渉結果（接続中は固定）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureMask {
    pub version: u32,              // 使用するプロトコルバージョン
    pub actions: ActionFlags,      // フィルタが使ってよい修正アクション
    pub skipped: ProtocolFlags,    // コールバックを呼ばない手順（フィルタ側の宣言）
    pub mta_skipped: ProtocolFlags, // MTAが送信自体を省略する手順
    pub no_reply: ProtocolFlags,   // MTAが応答を待たない手順
    pub drain: DrainPolicy,        // 決定済みメッセージの後続パケットの扱い
}

impl FeatureMask {
    /// そのコマンドのコールバックを抑止するか
    pub fn is_skipped(&self, cmd: MilterCommand) -> bool {
        ProtocolFlags::skip_flag(cmd).is_some_and(|flag| self.skipped.contains(flag))
    }

    /// そのコマンドに応答不要か
    pub fn is_no_reply(&self, cmd: MilterCommand) -> bool {
        ProtocolFlags::no_reply_flag(cmd).is_some_and(|flag| self.no_reply.contains(flag))
    }

    /// 修正アクションが交渉済みか
    pub fn allows(&self, action: ActionFlags) -> bool {
        self.actions.contains(action)
    }
}

/// オプション交渉器（フィルタ側の要求のみを持つ。交渉結果はセッションが保持）
#[derive(Debug, Clone)]
pub struct Negotiator {
    required_actions: ActionFlags, // フィルタが使う修正アクション
    skip_steps: ProtocolFlags,     // 省略したい手順（応答不要フラグを含んでよい）
    drain_override: Option<DrainPolicy>,
}

impl Negotiator {
    pub fn new(required_actions: ActionFlags, skip_steps: ProtocolFlags) -> Self {
        Negotiator {
            required_actions,
            skip_steps,
            drain_override: None,
        }
    }

    /// ドレイン時の扱いをバージョンに関係なく固定する
    pub fn with_drain_policy(mut self, policy: Option<DrainPolicy>) -> Self {
        self.drain_override = policy;
        self
    }

    /// MTAのOPTNEGを受けてFeatureMaskと応答パケットを得る
    pub fn negotiate(&self, payload: &[u8]) -> Result<(FeatureMask, Packet), MilterError> {
        let theirs = OptNeg::parse(payload)?;
        crate::printdaytimeln!(
            "SMFIC_OPTNEG: protocol_ver={} actions=0x{:08X} protocol_flags=0x{:08X}",
            theirs.version,
            theirs.actions.bits(),
            theirs.protocol.bits()
        );

        // バージョン: 対応範囲内なら小さい方に合わせる
        if theirs.version < MIN_MILTER_VERSION {
            return Err(MilterError::UnsupportedVersion(theirs.version));
        }
        let version = theirs.version.min(MILTER_VERSION);

        // アクション: 必要なものが全て提供されていること
        let missing = self.required_actions & !theirs.actions;
        if !missing.is_empty() {
            return Err(MilterError::ActionNotOffered {
                missing: missing.names().join(","),
            });
        }

        // 手順省略: MTAが省略できるものだけを返す（省略できない分はフィルタ側で抑止）
        let requested = self.skip_steps;
        let reflected = requested & theirs.protocol;
        let unsupported = requested & !theirs.protocol;
        if !unsupported.is_empty() {
            crate::printdaytimeln!(
                "MTAが省略に未対応の手順(フィルタ側で抑止): {}",
                unsupported.names().join(",")
            );
        }

        let mask = FeatureMask {
            version,
            actions: self.required_actions,
            skipped: requested & ProtocolFlags::SKIP_STEPS,
            mta_skipped: reflected & ProtocolFlags::SKIP_STEPS,
            no_reply: reflected & ProtocolFlags::NO_REPLY,
            drain: self
                .drain_override
                .unwrap_or_else(|| DrainPolicy::for_version(version)),
        };
        let ours = OptNeg {
            version,
            actions: self.required_actions,
            protocol: reflected,
        };
        crate::printdaytimeln!(
            "SMFIR_OPTNEG: version={} actions={:?} protocol={:?}",
            version,
            ours.actions.names(),
            ours.protocol.names()
        );
        Ok((mask, ours.to_packet()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn optneg_payload(version: u32, actions: u32, protocol: u32) -> Vec<u8> {
        OptNeg {
            version,
            actions: ActionFlags::from_bits(actions),
            protocol: ProtocolFlags::from_bits(protocol),
        }
        .to_packet()
        .payload
    }

    #[test]
    fn negotiates_version_actions_and_skips() {
        let neg = Negotiator::new(
            ActionFlags::ADD_HEADERS | ActionFlags::QUARANTINE,
            ProtocolFlags::NO_BODY | ProtocolFlags::NO_HELO,
        );
        let (mask, reply) = neg.negotiate(&optneg_payload(6, 0x1FF, 0x1F_FFFF)).unwrap();
        assert_eq!(mask.version, 6);
        assert!(mask.allows(ActionFlags::ADD_HEADERS));
        assert!(!mask.allows(ActionFlags::CHANGE_BODY));
        assert!(mask.is_skipped(MilterCommand::Body));
        assert!(mask.is_skipped(MilterCommand::Helo));
        assert!(!mask.is_skipped(MilterCommand::Header));
        assert_eq!(mask.drain, DrainPolicy::Repeat);

        let ours = OptNeg::parse(&reply.payload).unwrap();
        assert_eq!(reply.command, b'O');
        assert_eq!(ours.version, 6);
        assert_eq!(ours.actions.bits(), 0x21);
        assert_eq!(ours.protocol.bits(), 0x12);
    }

    #[test]
    fn newer_mta_is_pinned_to_our_version() {
        let neg = Negotiator::new(ActionFlags::empty(), ProtocolFlags::empty());
        let (mask, _) = neg.negotiate(&optneg_payload(9, 0, 0)).unwrap();
        assert_eq!(mask.version, MILTER_VERSION);
    }

    #[test]
    fn old_version_is_fatal() {
        let neg = Negotiator::new(ActionFlags::empty(), ProtocolFlags::empty());
        let err = neg.negotiate(&optneg_payload(1, 0, 0)).unwrap_err();
        assert!(matches!(err, MilterError::UnsupportedVersion(1)));
    }

    #[test]
    fn missing_action_is_fatal() {
        let neg = Negotiator::new(
            ActionFlags::ADD_HEADERS | ActionFlags::CHANGE_FROM,
            ProtocolFlags::empty(),
        );
        let err = neg.negotiate(&optneg_payload(6, 0x01, 0)).unwrap_err();
        match err {
            MilterError::ActionNotOffered { missing } => assert_eq!(missing, "change_from"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn skip_not_offered_is_still_suppressed_locally() {
        let neg = Negotiator::new(ActionFlags::empty(), ProtocolFlags::NO_BODY);
        let (mask, reply) = neg.negotiate(&optneg_payload(2, 0x3F, 0x0F)).unwrap();
        assert!(mask.is_skipped(MilterCommand::Body));
        assert!(mask.mta_skipped.is_empty());
        assert_eq!(OptNeg::parse(&reply.payload).unwrap().protocol.bits(), 0);
        assert_eq!(mask.drain, DrainPolicy::Silent);
    }

    #[test]
    fn no_reply_flags_are_reflected() {
        let neg = Negotiator::new(ActionFlags::empty(), ProtocolFlags::NR_HEADER);
        let (mask, _) = neg.negotiate(&optneg_payload(6, 0, 0x1F_FFFF)).unwrap();
        assert!(mask.is_no_reply(MilterCommand::Header));
        assert!(!mask.is_skipped(MilterCommand::Header));
    }

    #[test]
    fn short_payload_is_malformed() {
        let neg = Negotiator::new(ActionFlags::empty(), ProtocolFlags::empty());
        assert!(matches!(
            neg.negotiate(&[0, 0, 0, 6]),
            Err(MilterError::MalformedPayload { .. })
        ));
        // 同じ交渉器で何度でも交渉できる（接続の再利用時）
        assert!(neg.negotiate(&optneg_payload(6, 0, 0)).is_ok());
        assert!(neg.negotiate(&optneg_payload(6, 0, 0)).is_ok());
    }

    #[test]
    fn drain_override_wins() {
        let neg = Negotiator::new(ActionFlags::empty(), ProtocolFlags::empty())
            .with_drain_policy(Some(DrainPolicy::Silent));
        let (mask, _) = neg.negotiate(&optneg_payload(6, 0, 0)).unwrap();
        assert_eq!(mask.drain, DrainPolicy::Silent);
    }
}
