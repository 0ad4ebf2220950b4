// =========================
// macros.rs
// MilterEngine マクロ保持モジュール
//
// 【このファイルで使う主なクレート】
// - crate::milter: NUL終端文字列の分解（split_cstrings）
// - crate::milter_command: マクロ種別（MacroStage）
//
// 【役割】
// - SMFIC_MACROペイロード（フェーズ1バイト + 名前\0値\0 ...）の分解
// - フェーズごとのマクロ集合を受信順を保って保持
// - 名前による検索（{name}形式・裸の名前のどちらでも可）
// =========================

use crate::error::MilterError;
use crate::milter::split_cstrings;
use crate::milter_command::MacroStage;

/// フェーズごとのマクロ集合（名前・値の順序付きリスト）
#[derive(Debug, Clone, Default)]
pub struct MacroStore {
    stages: Vec<(MacroStage, Vec<(String, String)>)>, // フェーズ順に並べて保持
}

impl MacroStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// SMFIC_MACROペイロードを適用し、対象フェーズを返す
    ///
    /// - ペイロードが空 → `MacroNoData`
    /// - 名前/値が0組 → 何もしない（エラーではない）
    /// - 文字列数が奇数 → `MacroNoData`
    /// - 同じフェーズの既存定義は丸ごと置き換える
    pub fn apply_packet(&mut self, payload: &[u8]) -> Result<MacroStage, MilterError> {
        let (&stage_byte, rest) = payload.split_first().ok_or(MilterError::MacroNoData)?;
        let stage = MacroStage::from_u8(stage_byte);
        let parts = split_cstrings(rest);
        if parts.is_empty() {
            return Ok(stage); // 空定義
        }
        if parts.len() % 2 != 0 {
            return Err(MilterError::MacroNoData);
        }
        let mut pairs = Vec::with_capacity(parts.len() / 2);
        let mut iter = parts.into_iter();
        while let (Some(name), Some(value)) = (iter.next(), iter.next()) {
            pairs.push((name, value));
        }
        self.replace_stage(stage, pairs);
        Ok(stage)
    }

    pub(crate) fn replace_stage(&mut self, stage: MacroStage, pairs: Vec<(String, String)>) {
        match self.stages.iter().position(|(s, _)| *s >= stage) {
            Some(idx) if self.stages[idx].0 == stage => self.stages[idx].1 = pairs,
            Some(idx) => self.stages.insert(idx, (stage, pairs)),
            None => self.stages.push((stage, pairs)),
        }
    }

    /// マクロ値を取得（後のフェーズの定義を優先）
    ///
    /// `"i"` と `"{i}"`、`"mail_addr"` と `"{mail_addr}"` は同じマクロとして扱う
    pub fn get(&self, name: &str) -> Option<&str> {
        let bare = name
            .strip_prefix('{')
            .and_then(|n| n.strip_suffix('}'))
            .unwrap_or(name);
        self.stages.iter().rev().find_map(|(_, pairs)| {
            pairs.iter().rev().find_map(|(k, v)| {
                let key = k.strip_prefix('{').and_then(|n| n.strip_suffix('}')).unwrap_or(k);
                (key == bare).then_some(v.as_str())
            })
        })
    }

    /// 指定フェーズのマクロ一覧
    pub fn stage(&self, stage: MacroStage) -> &[(String, String)] {
        self.stages
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, pairs)| pairs.as_slice())
            .unwrap_or(&[])
    }

    /// 保持しているマクロ数（全フェーズ合計）
    pub fn len(&self) -> usize {
        self.stages.iter().map(|(_, pairs)| pairs.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// メッセージ終了・中断時: メッセージ単位のマクロを破棄（接続・HELO分は残す）
    pub fn reset_message(&mut self) {
        self.stages.retain(|(stage, _)| stage.is_connection_scoped());
    }

    /// 全マクロ破棄（SMFIC_QUIT_NCによる接続再利用時）
    pub fn clear(&mut self) {
        self.stages.clear();
    }
}
