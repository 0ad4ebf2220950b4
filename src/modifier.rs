// =========================
// modifier.rs
// MilterEngine 修正アクション（ヘッダ追加・宛先変更・本文置換など）
//
// 【このファイルで使う主なクレート】
// - std: バイト操作（to_be_bytes）、チャンク分割（chunks）
// - crate::milter_command: ActionFlags / ReplyCode
// - crate::packet: Packet / MILTER_CHUNK_SIZE
//
// 【役割】
// - ModifyAction: 本文終了時に送る修正アクション
// - encode_modification: 修正アクションを応答パケット列へ変換
// - Modifier: コールバックから積まれた修正アクションの保留キュー
//   （本文終了後〜最終応答前の期間外、未交渉のアクションはエラーで拒否）
// =========================

use crate::error::MilterError;
use crate::milter_command::{ActionFlags, ReplyCode};
use crate::packet::{Packet, MILTER_CHUNK_SIZE};

/// 修正アクション
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModifyAction {
    /// ヘッダを末尾に追加
    AddHeader { name: String, value: String },
    /// 指定位置(0始まり)にヘッダを挿入
    InsertHeader { index: u32, name: String, value: String },
    /// 指定位置のヘッダを置換（値が空なら削除）
    ChangeHeader { index: u32, name: String, value: String },
    /// エンベロープ宛先を追加
    AddRecipient(String),
    /// エンベロープ宛先を削除
    DeleteRecipient(String),
    /// エンベロープ差出人を置換（ESMTP引数は任意）
    ChangeFrom { sender: String, args: Option<String> },
    /// 本文全体を置換
    ReplaceBody(Vec<u8>),
    /// 理由付きで隔離
    Quarantine(String),
}

impl ModifyAction {
    /// このアクションに必要な交渉済みアクションフラグ
    pub fn required_flag(&self) -> ActionFlags {
        match self {
            ModifyAction::AddHeader { .. } | ModifyAction::InsertHeader { .. } => {
                ActionFlags::ADD_HEADERS
            }
            ModifyAction::ChangeHeader { .. } => ActionFlags::CHANGE_HEADERS,
            ModifyAction::AddRecipient(_) => ActionFlags::ADD_RCPT,
            ModifyAction::DeleteRecipient(_) => ActionFlags::DELETE_RCPT,
            ModifyAction::ChangeFrom { .. } => ActionFlags::CHANGE_FROM,
            ModifyAction::ReplaceBody(_) => ActionFlags::CHANGE_BODY,
            ModifyAction::Quarantine(_) => ActionFlags::QUARANTINE,
        }
    }

    /// NUL区切りのペイロードを壊す値を拒否（本文置換はバイト列のまま送るので対象外）
    pub fn validate(&self) -> Result<(), MilterError> {
        match self {
            ModifyAction::AddHeader { name, value }
            | ModifyAction::InsertHeader { name, value, .. }
            | ModifyAction::ChangeHeader { name, value, .. } => {
                if name.is_empty() || name.contains(['\0', ':', ' ']) {
                    return Err(MilterError::InvalidReply(format!("ヘッダ名不正: {:?}", name)));
                }
                no_nul("ヘッダ値", value)
            }
            ModifyAction::AddRecipient(rcpt) | ModifyAction::DeleteRecipient(rcpt) => no_nul("宛先", rcpt),
            ModifyAction::ChangeFrom { sender, args } => {
                no_nul("差出人", sender)?;
                match args {
                    Some(args) => no_nul("ESMTP引数", args),
                    None => Ok(()),
                }
            }
            ModifyAction::ReplaceBody(_) => Ok(()),
            ModifyAction::Quarantine(reason) => no_nul("隔離理由", reason),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModifyAction::AddHeader { .. } => "add_header",
            ModifyAction::InsertHeader { .. } => "insert_header",
            ModifyAction::ChangeHeader { .. } => "change_header",
            ModifyAction::AddRecipient(_) => "add_rcpt",
            ModifyAction::DeleteRecipient(_) => "delete_rcpt",
            ModifyAction::ChangeFrom { .. } => "change_from",
            ModifyAction::ReplaceBody(_) => "replace_body",
            ModifyAction::Quarantine(_) => "quarantine",
        }
    }
}

fn no_nul(field: &str, value: &str) -> Result<(), MilterError> {
    if value.contains('\0') {
        return Err(MilterError::InvalidReply(format!("{}にNULを含む: {:?}", field, value)));
    }
    Ok(())
}

// 文字列をNUL終端して追記
fn push_cstring(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

// 宛先アドレスは角括弧付きで送る
fn bracketed(addr: &str) -> String {
    if addr.starts_with('<') && addr.ends_with('>') {
        addr.to_string()
    } else {
        format!("<{}>", addr)
    }
}

// 位置(4バイトBE) + 名前\0 + 値\0
fn indexed_header(index: u32, name: &str, value: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + name.len() + value.len() + 2);
    payload.extend_from_slice(&index.to_be_bytes());
    push_cstring(&mut payload, name);
    push_cstring(&mut payload, value);
    payload
}

/// 修正アクションを応答パケット列へ変換
///
/// 本文置換のみ `MILTER_CHUNK_SIZE` ごとに複数パケットへ分割される。
/// 空の本文置換は空ペイロード1パケット。
pub fn encode_modification(action: &ModifyAction) -> Vec<Packet> {
    match action {
        ModifyAction::AddHeader { name, value } => {
            let mut payload = Vec::with_capacity(name.len() + value.len() + 2);
            push_cstring(&mut payload, name);
            push_cstring(&mut payload, value);
            vec![Packet::new(ReplyCode::AddHeader.as_u8(), payload)]
        }
        ModifyAction::InsertHeader { index, name, value } => vec![Packet::new(
            ReplyCode::InsHeader.as_u8(),
            indexed_header(*index, name, value),
        )],
        ModifyAction::ChangeHeader { index, name, value } => vec![Packet::new(
            ReplyCode::ChgHeader.as_u8(),
            indexed_header(*index, name, value),
        )],
        ModifyAction::AddRecipient(rcpt) => {
            let mut payload = Vec::new();
            push_cstring(&mut payload, &bracketed(rcpt));
            vec![Packet::new(ReplyCode::AddRcpt.as_u8(), payload)]
        }
        ModifyAction::DeleteRecipient(rcpt) => {
            let mut payload = Vec::new();
            push_cstring(&mut payload, &bracketed(rcpt));
            vec![Packet::new(ReplyCode::DelRcpt.as_u8(), payload)]
        }
        ModifyAction::ChangeFrom { sender, args } => {
            let mut payload = Vec::new();
            push_cstring(&mut payload, &bracketed(sender));
            if let Some(args) = args {
                push_cstring(&mut payload, args);
            }
            vec![Packet::new(ReplyCode::ChgFrom.as_u8(), payload)]
        }
        ModifyAction::ReplaceBody(body) => {
            if body.is_empty() {
                return vec![Packet::empty(ReplyCode::ReplBody.as_u8())];
            }
            body.chunks(MILTER_CHUNK_SIZE)
                .map(|chunk| Packet::new(ReplyCode::ReplBody.as_u8(), chunk.to_vec()))
                .collect()
        }
        ModifyAction::Quarantine(reason) => {
            let mut payload = Vec::new();
            push_cstring(&mut payload, reason);
            vec![Packet::new(ReplyCode::Quarantine.as_u8(), payload)]
        }
    }
}

/// 修正アクションの保留キュー
///
/// 本文終了コールバックの間だけ受け付け、終了後にセッションが順番通りに送信する。
#[derive(Debug, Clone, Default)]
pub struct Modifier {
    allowed: ActionFlags,       // 交渉済みアクション
    open: bool,                 // 本文終了後〜最終応答前か
    pending: Vec<ModifyAction>, // 送信待ち（積まれた順）
}

impl Modifier {
    pub fn new(allowed: ActionFlags) -> Self {
        Modifier {
            allowed,
            open: false,
            pending: Vec::new(),
        }
    }

    /// 修正アクションを積む（期間外・未交渉ならエラー）
    pub fn push(&mut self, action: ModifyAction) -> Result<(), MilterError> {
        if !self.open {
            return Err(MilterError::ModificationOutsideWindow {
                action: action.as_str(),
            });
        }
        if !self.allowed.contains(action.required_flag()) {
            return Err(MilterError::ActionNotNegotiated {
                action: action.as_str(),
            });
        }
        action.validate()?;
        self.pending.push(action);
        Ok(())
    }

    pub fn add_header(&mut self, name: &str, value: &str) -> Result<(), MilterError> {
        self.push(ModifyAction::AddHeader {
            name: name.to_string(),
            value: value.to_string(),
        })
    }

    pub fn insert_header(&mut self, index: u32, name: &str, value: &str) -> Result<(), MilterError> {
        self.push(ModifyAction::InsertHeader {
            index,
            name: name.to_string(),
            value: value.to_string(),
        })
    }

    pub fn change_header(&mut self, index: u32, name: &str, value: &str) -> Result<(), MilterError> {
        self.push(ModifyAction::ChangeHeader {
            index,
            name: name.to_string(),
            value: value.to_string(),
        })
    }

    /// ヘッダ削除（値が空のChangeHeader）
    pub fn delete_header(&mut self, index: u32, name: &str) -> Result<(), MilterError> {
        self.change_header(index, name, "")
    }

    pub fn add_recipient(&mut self, rcpt: &str) -> Result<(), MilterError> {
        self.push(ModifyAction::AddRecipient(rcpt.to_string()))
    }

    pub fn delete_recipient(&mut self, rcpt: &str) -> Result<(), MilterError> {
        self.push(ModifyAction::DeleteRecipient(rcpt.to_string()))
    }

    pub fn change_from(&mut self, sender: &str, args: Option<&str>) -> Result<(), MilterError> {
        self.push(ModifyAction::ChangeFrom {
            sender: sender.to_string(),
            args: args.map(str::to_string),
        })
    }

    pub fn replace_body(&mut self, body: &[u8]) -> Result<(), MilterError> {
        self.push(ModifyAction::ReplaceBody(body.to_vec()))
    }

    pub fn quarantine(&mut self, reason: &str) -> Result<(), MilterError> {
        self.push(ModifyAction::Quarantine(reason.to_string()))
    }

    /// アクションが交渉済みか（コールバック側の事前確認用）
    pub fn can(&self, action: ActionFlags) -> bool {
        self.allowed.contains(action)
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn pending(&self) -> &[ModifyAction] {
        &self.pending
    }

    pub(crate) fn set_allowed(&mut self, allowed: ActionFlags) {
        self.allowed = allowed;
    }

    /// 本文終了の受信で受付開始
    pub(crate) fn open_window(&mut self) {
        self.pending.clear();
        self.open = true;
    }

    /// 受付終了し、積まれたアクションを順番通りに取り出す
    pub(crate) fn close_window(&mut self) -> Vec<ModifyAction> {
        self.open = false;
        std::mem::take(&mut self.pending)
    }
}
