// =========================
// handler.rs
// MilterEngine フィルタ処理のコールバック定義
//
// 【このファイルで使う主なクレート】
// - async-trait: 非同期メソッドを持つトレイト（Milter）
// - crate::context: コールバックに渡す文脈（Context）
//
// 【役割】
// - Milter: 接続ごとに1インスタンス生成されるフィルタ本体のインターフェース
// - 各コールバックの既定実装はCONTINUE（必要なものだけ実装すればよい）
// =========================

use async_trait::async_trait;

use crate::context::Context;
use crate::error::MilterError;
use crate::milter::AddressFamily;
use crate::response::Response;

/// フィルタ処理のコールバック
///
/// セッションはMTAから届いた順にコールバックを呼ぶ。
/// `Err` を返すと接続を終了する（`disconnect` は必ず呼ばれる）。
/// 修正アクション（`ctx.add_header` 等）は `body` の中でだけ受け付けられる。
#[async_trait]
pub trait Milter: Send {
    /// 接続開始時（メッセージIDは空）と各メッセージ開始時（MAIL FROM直前）に呼ばれる
    async fn init(&mut self, _session_id: &str, _message_id: &str) {}

    /// 接続情報（SMFIC_CONNECT）
    async fn connect(
        &mut self,
        _ctx: &mut Context,
        _host: &str,
        _family: AddressFamily,
        _port: u16,
        _address: &str,
    ) -> Result<Response, MilterError> {
        Ok(Response::Continue)
    }

    /// HELO/EHLO名（SMFIC_HELO）
    async fn helo(&mut self, _ctx: &mut Context, _name: &str) -> Result<Response, MilterError> {
        Ok(Response::Continue)
    }

    /// エンベロープ差出人（角括弧付き, SMFIC_MAIL）
    async fn mail_from(&mut self, _ctx: &mut Context, _address: &str) -> Result<Response, MilterError> {
        Ok(Response::Continue)
    }

    /// エンベロープ宛先（宛先ごとに1回, SMFIC_RCPT）
    async fn rcpt_to(&mut self, _ctx: &mut Context, _address: &str) -> Result<Response, MilterError> {
        Ok(Response::Continue)
    }

    /// DATAコマンド（SMFIC_DATA）
    async fn data(&mut self, _ctx: &mut Context) -> Result<Response, MilterError> {
        Ok(Response::Continue)
    }

    /// ヘッダ1件ごと（SMFIC_HEADER）
    async fn header(
        &mut self,
        _ctx: &mut Context,
        _name: &str,
        _value: &str,
    ) -> Result<Response, MilterError> {
        Ok(Response::Continue)
    }

    /// 全ヘッダ受信後に1回（SMFIC_EOH）。全ヘッダは `ctx.headers()`
    async fn headers(&mut self, _ctx: &mut Context) -> Result<Response, MilterError> {
        Ok(Response::Continue)
    }

    /// 本文チャンクごと（SMFIC_BODY, 最大64KiB程度）
    async fn body_chunk(&mut self, _ctx: &mut Context, _chunk: &[u8]) -> Result<Response, MilterError> {
        Ok(Response::Continue)
    }

    /// 本文終了（SMFIC_BODYEOB）。修正アクションはここで積む
    async fn body(&mut self, _ctx: &mut Context) -> Result<Response, MilterError> {
        Ok(Response::Continue)
    }

    /// 未知のSMTPコマンド（SMFIC_UNKNOWN）
    async fn unknown(&mut self, _ctx: &mut Context, _command: &str) -> Result<Response, MilterError> {
        Ok(Response::Continue)
    }

    /// メッセージ処理の中断（SMFIC_ABORT）。メッセージ単位の状態を捨てる
    async fn abort(&mut self, _ctx: &mut Context) {}

    /// 接続終了時に1回だけ呼ばれる（エラー終了時も含む）
    async fn disconnect(&mut self) {}
}
