// =========================
// context.rs
// MilterEngine コールバックに渡すセッション文脈
//
// 【このファイルで使う主なクレート】
// - crate::macros: マクロ保持（MacroStore）
// - crate::modifier: 修正アクションの保留キュー（Modifier）
//
// 【役割】
// - セッションID・メッセージID・マクロ・受信済みヘッダ（受信順）をコールバックへ公開
// - 修正アクションの受付窓口（本文終了時のみ有効）
// =========================

use crate::error::MilterError;
use crate::macros::MacroStore;
use crate::milter_command::ActionFlags;
use crate::modifier::Modifier;

/// 受信順を保ったヘッダ一覧（位置指定の修正アクションで使う）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList {
    fields: Vec<(String, String)>,
}

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: String, value: String) {
        self.fields.push((name, value));
    }

    /// 名前（大文字小文字無視）で最初の値を取得
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// 同名ヘッダの値を全て取得（Received等）
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// 受信順のイテレータ
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn clear(&mut self) {
        self.fields.clear();
    }
}

/// コールバックに渡す文脈（セッションが排他的に所有）
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub(crate) session_id: String,
    pub(crate) message_id: Option<String>,
    pub(crate) macros: MacroStore,
    pub(crate) headers: HeaderList,
    pub(crate) modifier: Modifier,
}

impl Context {
    pub fn new(session_id: impl Into<String>) -> Self {
        Context {
            session_id: session_id.into(),
            ..Self::default()
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// 現在のメッセージID（キューIDマクロ "i"、無ければ生成したID）
    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    /// マクロ値を取得（"{name}" 形式・裸の名前どちらも可）
    pub fn macro_value(&self, name: &str) -> Option<&str> {
        self.macros.get(name)
    }

    pub fn macros(&self) -> &MacroStore {
        &self.macros
    }

    /// 現在のメッセージで受信済みのヘッダ（受信順）
    pub fn headers(&self) -> &HeaderList {
        &self.headers
    }

    /// 修正アクションの受付窓口
    pub fn modifier(&mut self) -> &mut Modifier {
        &mut self.modifier
    }

    /// アクションが交渉済みか
    pub fn can(&self, action: ActionFlags) -> bool {
        self.modifier.can(action)
    }

    pub fn add_header(&mut self, name: &str, value: &str) -> Result<(), MilterError> {
        self.modifier.add_header(name, value)
    }

    pub fn insert_header(&mut self, index: u32, name: &str, value: &str) -> Result<(), MilterError> {
        self.modifier.insert_header(index, name, value)
    }

    pub fn change_header(&mut self, index: u32, name: &str, value: &str) -> Result<(), MilterError> {
        self.modifier.change_header(index, name, value)
    }

    pub fn add_recipient(&mut self, rcpt: &str) -> Result<(), MilterError> {
        self.modifier.add_recipient(rcpt)
    }

    pub fn delete_recipient(&mut self, rcpt: &str) -> Result<(), MilterError> {
        self.modifier.delete_recipient(rcpt)
    }

    pub fn change_from(&mut self, sender: &str, args: Option<&str>) -> Result<(), MilterError> {
        self.modifier.change_from(sender, args)
    }

    pub fn replace_body(&mut self, body: &[u8]) -> Result<(), MilterError> {
        self.modifier.replace_body(body)
    }

    pub fn quarantine(&mut self, reason: &str) -> Result<(), MilterError> {
        self.modifier.quarantine(reason)
    }

    // メッセージ終了・中断時のリセット
    pub(crate) fn reset_message(&mut self) {
        self.message_id = None;
        self.macros.reset_message();
        self.headers.clear();
        self.modifier.close_window();
    }
}
