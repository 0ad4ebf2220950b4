// =========================
// milter_command.rs
// Milterプロトコルのコマンド種別・応答種別・マクロ種別・フラグ定義
//
// 【このファイルで使う主なクレート】
// - std: 列挙型・ビット演算トレイト（ops::BitOr等）・フォーマット
//
// 【役割】
// - MilterCommand: MTA→フィルタのコマンド種別（mfdef.h互換）
// - ReplyCode: フィルタ→MTAの応答・修正アクション種別
// - MacroStage: マクロ定義パケット先頭バイトのフェーズ種別
// - ActionFlags / ProtocolFlags: OPTNEGで交換するビットフラグ
// =========================

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

// =========================
// MTA→フィルタ方向のコマンド（mfdef.hのSMFIC_*）
// =========================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MilterCommand {
    Abort,   // SMFIC_ABORT ('A'): メッセージ処理中断
    Body,    // SMFIC_BODY ('B'): 本文チャンク
    Connect, // SMFIC_CONNECT ('C'): 接続情報
    Macro,   // SMFIC_MACRO ('D'): マクロ定義
    BodyEob, // SMFIC_BODYEOB ('E'): 本文終了
    Helo,    // SMFIC_HELO ('H'): HELO/EHLO
    QuitNc,  // SMFIC_QUIT_NC ('K'): 接続維持したまま終了（次の接続が続く）
    Header,  // SMFIC_HEADER ('L'): ヘッダ1件
    Mail,    // SMFIC_MAIL ('M'): MAIL FROM
    Eoh,     // SMFIC_EOH ('N'): ヘッダ終了
    OptNeg,  // SMFIC_OPTNEG ('O'): オプション交渉
    Quit,    // SMFIC_QUIT ('Q'): セッション終了
    Rcpt,    // SMFIC_RCPT ('R'): RCPT TO
    Data,    // SMFIC_DATA ('T'): DATAコマンド
    Unknown, // SMFIC_UNKNOWN ('U'): 未知のSMTPコマンド
}

impl MilterCommand {
    /// 1バイト値からMilterCommandへ変換（未定義ならNone）
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            b'A' => Some(MilterCommand::Abort),
            b'B' => Some(MilterCommand::Body),
            b'C' => Some(MilterCommand::Connect),
            b'D' => Some(MilterCommand::Macro),
            b'E' => Some(MilterCommand::BodyEob),
            b'H' => Some(MilterCommand::Helo),
            b'K' => Some(MilterCommand::QuitNc),
            b'L' => Some(MilterCommand::Header),
            b'M' => Some(MilterCommand::Mail),
            b'N' => Some(MilterCommand::Eoh),
            b'O' => Some(MilterCommand::OptNeg),
            b'Q' => Some(MilterCommand::Quit),
            b'R' => Some(MilterCommand::Rcpt),
            b'T' => Some(MilterCommand::Data),
            b'U' => Some(MilterCommand::Unknown),
            _ => None,
        }
    }

    /// ワイヤ上のコマンドバイト
    pub fn as_u8(self) -> u8 {
        match self {
            MilterCommand::Abort => b'A',
            MilterCommand::Body => b'B',
            MilterCommand::Connect => b'C',
            MilterCommand::Macro => b'D',
            MilterCommand::BodyEob => b'E',
            MilterCommand::Helo => b'H',
            MilterCommand::QuitNc => b'K',
            MilterCommand::Header => b'L',
            MilterCommand::Mail => b'M',
            MilterCommand::Eoh => b'N',
            MilterCommand::OptNeg => b'O',
            MilterCommand::Quit => b'Q',
            MilterCommand::Rcpt => b'R',
            MilterCommand::Data => b'T',
            MilterCommand::Unknown => b'U',
        }
    }

    /// コマンド名文字列（ログ用）
    pub fn as_str(&self) -> &'static str {
        match self {
            MilterCommand::Abort => "SMFIC_ABORT",
            MilterCommand::Body => "SMFIC_BODY",
            MilterCommand::Connect => "SMFIC_CONNECT",
            MilterCommand::Macro => "SMFIC_MACRO",
            MilterCommand::BodyEob => "SMFIC_BODYEOB",
            MilterCommand::Helo => "SMFIC_HELO",
            MilterCommand::QuitNc => "SMFIC_QUIT_NC",
            MilterCommand::Header => "SMFIC_HEADER",
            MilterCommand::Mail => "SMFIC_MAIL",
            MilterCommand::Eoh => "SMFIC_EOH",
            MilterCommand::OptNeg => "SMFIC_OPTNEG",
            MilterCommand::Quit => "SMFIC_QUIT",
            MilterCommand::Rcpt => "SMFIC_RCPT",
            MilterCommand::Data => "SMFIC_DATA",
            MilterCommand::Unknown => "SMFIC_UNKNOWN",
        }
    }
}

// =========================
// フィルタ→MTA方向の応答（mfdef.hのSMFIR_*）
// =========================
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    AddRcpt,    // SMFIR_ADDRCPT ('+')
    DelRcpt,    // SMFIR_DELRCPT ('-')
    Accept,     // SMFIR_ACCEPT ('a')
    ReplBody,   // SMFIR_REPLBODY ('b')
    Continue,   // SMFIR_CONTINUE ('c')
    Discard,    // SMFIR_DISCARD ('d')
    ChgFrom,    // SMFIR_CHGFROM ('e')
    AddHeader,  // SMFIR_ADDHEADER ('h')
    InsHeader,  // SMFIR_INSHEADER ('i')
    ChgHeader,  // SMFIR_CHGHEADER ('m')
    Quarantine, // SMFIR_QUARANTINE ('q')
    Reject,     // SMFIR_REJECT ('r')
    TempFail,   // SMFIR_TEMPFAIL ('t')
    ReplyCode,  // SMFIR_REPLYCODE ('y')
    OptNeg,     // SMFIC_OPTNEG ('O') 応答
}

impl ReplyCode {
    /// ワイヤ上の応答バイト
    pub fn as_u8(self) -> u8 {
        match self {
            ReplyCode::AddRcpt => b'+',
            ReplyCode::DelRcpt => b'-',
            ReplyCode::Accept => b'a',
            ReplyCode::ReplBody => b'b',
            ReplyCode::Continue => b'c',
            ReplyCode::Discard => b'd',
            ReplyCode::ChgFrom => b'e',
            ReplyCode::AddHeader => b'h',
            ReplyCode::InsHeader => b'i',
            ReplyCode::ChgHeader => b'm',
            ReplyCode::Quarantine => b'q',
            ReplyCode::Reject => b'r',
            ReplyCode::TempFail => b't',
            ReplyCode::ReplyCode => b'y',
            ReplyCode::OptNeg => b'O',
        }
    }

    /// 1バイト値からReplyCodeへ変換（テスト・ログ用）
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            b'+' => Some(ReplyCode::AddRcpt),
            b'-' => Some(ReplyCode::DelRcpt),
            b'a' => Some(ReplyCode::Accept),
            b'b' => Some(ReplyCode::ReplBody),
            b'c' => Some(ReplyCode::Continue),
            b'd' => Some(ReplyCode::Discard),
            b'e' => Some(ReplyCode::ChgFrom),
            b'h' => Some(ReplyCode::AddHeader),
            b'i' => Some(ReplyCode::InsHeader),
            b'm' => Some(ReplyCode::ChgHeader),
            b'q' => Some(ReplyCode::Quarantine),
            b'r' => Some(ReplyCode::Reject),
            b't' => Some(ReplyCode::TempFail),
            b'y' => Some(ReplyCode::ReplyCode),
            b'O' => Some(ReplyCode::OptNeg),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyCode::AddRcpt => "SMFIR_ADDRCPT",
            ReplyCode::DelRcpt => "SMFIR_DELRCPT",
            ReplyCode::Accept => "SMFIR_ACCEPT",
            ReplyCode::ReplBody => "SMFIR_REPLBODY",
            ReplyCode::Continue => "SMFIR_CONTINUE",
            ReplyCode::Discard => "SMFIR_DISCARD",
            ReplyCode::ChgFrom => "SMFIR_CHGFROM",
            ReplyCode::AddHeader => "SMFIR_ADDHEADER",
            ReplyCode::InsHeader => "SMFIR_INSHEADER",
            ReplyCode::ChgHeader => "SMFIR_CHGHEADER",
            ReplyCode::Quarantine => "SMFIR_QUARANTINE",
            ReplyCode::Reject => "SMFIR_REJECT",
            ReplyCode::TempFail => "SMFIR_TEMPFAIL",
            ReplyCode::ReplyCode => "SMFIR_REPLYCODE",
            ReplyCode::OptNeg => "SMFIC_OPTNEG",
        }
    }
}

/// マクロ定義パケットの先頭バイト（どのコマンドの直前に届いたマクロか）
/// 後のフェーズほど順序値が大きい（検索時の優先順位に使う）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MacroStage {
    Connect, // 接続時マクロ（C）
    Helo,    // HELO/EHLO時マクロ（H）
    Mail,    // MAIL FROM時マクロ（M）
    Rcpt,    // RCPT TO時マクロ（R）
    Data,    // DATA時マクロ（T）
    Header,  // ヘッダ受信時マクロ（L）
    Eoh,     // ヘッダ終了時マクロ（N）
    Body,    // 本文受信時マクロ（B）
    Eob,     // 本文終了時マクロ（E）
    Unknown, // 未知コマンド時マクロ（U）
    Other(u8), // その他・拡張（バイト値で保持）
}

impl MacroStage {
    /// 1バイト識別子からMacroStageへ変換
    pub fn from_u8(b: u8) -> Self {
        match b {
            b'C' => MacroStage::Connect,
            b'H' => MacroStage::Helo,
            b'M' => MacroStage::Mail,
            b'R' => MacroStage::Rcpt,
            b'T' => MacroStage::Data,
            b'L' => MacroStage::Header,
            b'N' => MacroStage::Eoh,
            b'B' => MacroStage::Body,
            b'E' => MacroStage::Eob,
            b'U' => MacroStage::Unknown,
            other => MacroStage::Other(other),
        }
    }

    /// 接続単位で保持するマクロか（メッセージ終了で消えない）
    pub fn is_connection_scoped(&self) -> bool {
        matches!(self, MacroStage::Connect | MacroStage::Helo)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MacroStage::Connect => "MACRO_Connect",
            MacroStage::Helo => "MACRO_Helo",
            MacroStage::Mail => "MACRO_Mail",
            MacroStage::Rcpt => "MACRO_Rcpt",
            MacroStage::Data => "MACRO_Data",
            MacroStage::Header => "MACRO_Header",
            MacroStage::Eoh => "MACRO_Eoh",
            MacroStage::Body => "MACRO_Body",
            MacroStage::Eob => "MACRO_Eob",
            MacroStage::Unknown => "MACRO_Unknown",
            MacroStage::Other(_) => "MACRO_Other",
        }
    }
}

// =========================
// OPTNEGで交換するビットフラグ
// - flag_set!でu32ラッパー型・定数・名前表を生成
// =========================
macro_rules! flag_set {
    (
        $(#[$meta:meta])*
        $name:ident { $( $flag:ident = $bit:expr, $label:expr; )* }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(u32);

        impl $name {
            $( pub const $flag: $name = $name($bit); )*

            /// 名前付きフラグの一覧（ログ出力・設定読込用）
            const TABLE: &'static [($name, &'static str)] = &[ $( ($name($bit), $label), )* ];

            pub const fn empty() -> Self {
                $name(0)
            }

            pub const fn from_bits(bits: u32) -> Self {
                $name(bits)
            }

            pub const fn bits(self) -> u32 {
                self.0
            }

            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub const fn intersects(self, other: Self) -> bool {
                self.0 & other.0 != 0
            }

            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            /// 設定ファイル上の名前からフラグを取得
            pub fn from_name(name: &str) -> Option<Self> {
                Self::TABLE
                    .iter()
                    .find(|(_, label)| label.eq_ignore_ascii_case(name.trim()))
                    .map(|(flag, _)| *flag)
            }

            /// 立っている名前付きフラグの名前一覧
            pub fn names(self) -> Vec<&'static str> {
                Self::TABLE
                    .iter()
                    .filter(|(flag, _)| self.contains(*flag))
                    .map(|(_, label)| *label)
                    .collect()
            }
        }

        impl BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                $name(self.0 | rhs.0)
            }
        }

        impl BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }

        impl BitAnd for $name {
            type Output = Self;
            fn bitand(self, rhs: Self) -> Self {
                $name(self.0 & rhs.0)
            }
        }

        impl Not for $name {
            type Output = Self;
            fn not(self) -> Self {
                $name(!self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}(0x{:08X} {:?})", stringify!($name), self.0, self.names())
            }
        }
    };
}

flag_set! {
    /// フィルタが行う修正アクション（SMFIF_*）
    ActionFlags {
        ADD_HEADERS = 0x0000_0001, "add_header";
        CHANGE_BODY = 0x0000_0002, "change_body";
        ADD_RCPT = 0x0000_0004, "add_rcpt";
        DELETE_RCPT = 0x0000_0008, "delete_rcpt";
        CHANGE_HEADERS = 0x0000_0010, "change_header";
        QUARANTINE = 0x0000_0020, "quarantine";
        CHANGE_FROM = 0x0000_0040, "change_from";
    }
}

flag_set! {
    /// 省略するプロトコル手順・応答不要手順（SMFIP_*）
    ProtocolFlags {
        NO_CONNECT = 0x0000_0001, "connect";
        NO_HELO = 0x0000_0002, "helo";
        NO_MAIL = 0x0000_0004, "mail";
        NO_RCPT = 0x0000_0008, "rcpt";
        NO_BODY = 0x0000_0010, "body";
        NO_HEADERS = 0x0000_0020, "header";
        NO_EOH = 0x0000_0040, "eoh";
        NR_HEADER = 0x0000_0080, "noreply_header";
        NO_UNKNOWN = 0x0000_0100, "unknown";
        NO_DATA = 0x0000_0200, "data";
        NR_CONNECT = 0x0000_1000, "noreply_connect";
        NR_HELO = 0x0000_2000, "noreply_helo";
        NR_MAIL = 0x0000_4000, "noreply_mail";
        NR_RCPT = 0x0000_8000, "noreply_rcpt";
        NR_DATA = 0x0001_0000, "noreply_data";
        NR_UNKNOWN = 0x0002_0000, "noreply_unknown";
        NR_EOH = 0x0004_0000, "noreply_eoh";
        NR_BODY = 0x0008_0000, "noreply_body";
    }
}

impl ProtocolFlags {
    /// 手順省略フラグのみ（応答不要フラグを除く）
    pub const SKIP_STEPS: ProtocolFlags = ProtocolFlags(0x0000_037F);
    /// 応答不要フラグのみ
    pub const NO_REPLY: ProtocolFlags = ProtocolFlags(0x000F_F080);

    /// コマンドに対応する手順省略フラグ
    pub fn skip_flag(cmd: MilterCommand) -> Option<Self> {
        match cmd {
            MilterCommand::Connect => Some(Self::NO_CONNECT),
            MilterCommand::Helo => Some(Self::NO_HELO),
            MilterCommand::Mail => Some(Self::NO_MAIL),
            MilterCommand::Rcpt => Some(Self::NO_RCPT),
            MilterCommand::Data => Some(Self::NO_DATA),
            MilterCommand::Header => Some(Self::NO_HEADERS),
            MilterCommand::Eoh => Some(Self::NO_EOH),
            MilterCommand::Body => Some(Self::NO_BODY),
            MilterCommand::Unknown => Some(Self::NO_UNKNOWN),
            _ => None,
        }
    }

    /// コマンドに対応する応答不要フラグ
    pub fn no_reply_flag(cmd: MilterCommand) -> Option<Self> {
        match cmd {
            MilterCommand::Connect => Some(Self::NR_CONNECT),
            MilterCommand::Helo => Some(Self::NR_HELO),
            MilterCommand::Mail => Some(Self::NR_MAIL),
            MilterCommand::Rcpt => Some(Self::NR_RCPT),
            MilterCommand::Data => Some(Self::NR_DATA),
            MilterCommand::Header => Some(Self::NR_HEADER),
            MilterCommand::Eoh => Some(Self::NR_EOH),
            MilterCommand::Body => Some(Self::NR_BODY),
            MilterCommand::Unknown => Some(Self::NR_UNKNOWN),
            _ => None,
        }
    }
}
