// =========================
// session.rs
// MilterEngine セッション状態機械（1接続につき1つ）
//
// 【このファイルで使う主なクレート】
// - ulid: セッションID・メッセージIDの生成
// - crate::handler: フィルタ本体のコールバック（Milter）
// - crate::negotiate: オプション交渉（Negotiator, FeatureMask）
// - crate::milter: 各コマンドのペイロード分解
// - crate::response / crate::modifier: 応答・修正アクションのパケット化
// - crate::printdaytimeln! / crate::debugdaytimeln!: ログ出力マクロ
//
// 【役割】
// - (現在フェーズ, 受信コマンド) → 次フェーズ の遷移表によるコマンド順序検証
// - 交渉で省略した手順の読み飛ばし・コールバック抑止
// - マクロ・ヘッダの蓄積、コールバック呼び出し、応答パケットの生成
// - 決定済みメッセージの後続パケットの読み捨て（ドレイン）
// - 修正アクションは本文終了時にまとめて送信（積まれた順、最終応答の前）
// =========================

use ulid::Ulid;

use crate::context::Context;
use crate::error::MilterError;
use crate::handler::Milter;
use crate::milter::{decode_connect, decode_envelope, decode_header, decode_helo, decode_unknown};
use crate::milter_command::{MacroStage, MilterCommand, ProtocolFlags};
use crate::modifier::encode_modification;
use crate::negotiate::{DrainPolicy, FeatureMask, Negotiator};
use crate::packet::Packet;
use crate::response::{encode_decision, Response};

/// セッションのフェーズ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingOptions, // OPTNEG待ち
    Negotiated,      // 交渉済み・接続情報待ち
    Connect,
    Helo,
    MailFrom,
    RcptTo,
    Data,
    Header,
    EndOfHeaders,
    BodyChunk,
    EndOfBody,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::AwaitingOptions => "AwaitingOptions",
            Phase::Negotiated => "Negotiated",
            Phase::Connect => "Connect",
            Phase::Helo => "Helo",
            Phase::MailFrom => "MailFrom",
            Phase::RcptTo => "RcptTo",
            Phase::Data => "Data",
            Phase::Header => "Header",
            Phase::EndOfHeaders => "EndOfHeaders",
            Phase::BodyChunk => "BodyChunk",
            Phase::EndOfBody => "EndOfBody",
        }
    }

    /// メッセージ処理中（MAIL FROM〜本文チャンク）か
    pub fn in_message(self) -> bool {
        matches!(
            self,
            Phase::MailFrom
                | Phase::RcptTo
                | Phase::Data
                | Phase::Header
                | Phase::EndOfHeaders
                | Phase::BodyChunk
        )
    }

    /// 接続単位のフェーズ（メッセージ終了後に戻る先）
    fn is_connection_level(self) -> bool {
        matches!(self, Phase::Negotiated | Phase::Connect | Phase::Helo)
    }
}

/// 遷移表: (現在フェーズ, コマンド) → 次フェーズ
///
/// HELO・DATA・ヘッダ・本文チャンクはMTA側で省略されうるため直接の辺を持つ。
pub fn transition(from: Phase, cmd: MilterCommand) -> Option<Phase> {
    use MilterCommand as C;
    use Phase::*;
    match (from, cmd) {
        (Negotiated, C::Connect) => Some(Connect),
        (Connect | Helo | EndOfBody, C::Helo) => Some(Helo),
        (Connect | Helo | EndOfBody, C::Mail) => Some(MailFrom),
        (MailFrom | RcptTo, C::Rcpt) => Some(RcptTo),
        (RcptTo, C::Data) => Some(Data),
        (RcptTo | Data | Header, C::Header) => Some(Header),
        (RcptTo | Data | Header, C::Eoh) => Some(EndOfHeaders),
        (EndOfHeaders | BodyChunk, C::Body) => Some(BodyChunk),
        (EndOfHeaders | BodyChunk, C::BodyEob) => Some(EndOfBody),
        _ => None,
    }
}

// 省略宣言できる手順（フェーズ順）
const SKIPPABLE_STEPS: [MilterCommand; 8] = [
    MilterCommand::Connect,
    MilterCommand::Helo,
    MilterCommand::Mail,
    MilterCommand::Rcpt,
    MilterCommand::Data,
    MilterCommand::Header,
    MilterCommand::Eoh,
    MilterCommand::Body,
];

/// 省略済み手順を読み飛ばして次フェーズを求める
///
/// 直接の辺が無い場合、省略された手順を経由した遷移を探す（経由先は必ず前進する）。
pub fn next_phase(from: Phase, cmd: MilterCommand, skipped: ProtocolFlags) -> Option<Phase> {
    if let Some(next) = transition(from, cmd) {
        return Some(next);
    }
    SKIPPABLE_STEPS
        .iter()
        .filter(|step| ProtocolFlags::skip_flag(**step).is_some_and(|flag| skipped.contains(flag)))
        .filter_map(|step| transition(from, *step).filter(|via| *via != from))
        .find_map(|via| next_phase(via, cmd, skipped))
}

/// 1パケット処理の結果
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Step {
    pub replies: Vec<Packet>, // 送信する応答（順番通り）
    pub close: bool,          // 接続を閉じる（SMFIC_QUIT）
}

impl Step {
    fn none() -> Self {
        Step::default()
    }

    fn reply(packet: Packet) -> Self {
        Step {
            replies: vec![packet],
            close: false,
        }
    }
}

fn out_of_order(phase: Phase, cmd: MilterCommand) -> MilterError {
    MilterError::OutOfOrder {
        phase: phase.as_str(),
        command: cmd.as_str(),
    }
}

/// 1接続分のセッション
pub struct Session<H: Milter> {
    handler: H,                    // フィルタ本体
    negotiator: Negotiator,        // オプション交渉
    mask: Option<FeatureMask>,     // 交渉結果
    phase: Phase,                  // 現在フェーズ
    conn_phase: Phase,             // メッセージ終了後に戻る接続単位のフェーズ
    ctx: Context,                  // マクロ・ヘッダ・修正アクション
    halted: Option<Response>,      // 決定済みの応答（ドレイン中）
    connection_halted: bool,       // 接続単位で決定済み（CONNECT/HELOでの決定）
    disconnected: bool,            // disconnect呼び出し済み
}

impl<H: Milter> Session<H> {
    pub fn new(handler: H, negotiator: Negotiator) -> Self {
        Session {
            handler,
            negotiator,
            mask: None,
            phase: Phase::AwaitingOptions,
            conn_phase: Phase::AwaitingOptions,
            ctx: Context::new(Ulid::new().to_string()),
            halted: None,
            connection_halted: false,
            disconnected: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn session_id(&self) -> &str {
        self.ctx.session_id()
    }

    pub fn feature_mask(&self) -> Option<&FeatureMask> {
        self.mask.as_ref()
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// 決定済みでドレイン中か
    pub fn is_draining(&self) -> bool {
        self.halted.is_some()
    }

    /// 受信パケット1つを処理して応答を返す
    pub async fn process(&mut self, packet: Packet) -> Result<Step, MilterError> {
        let cmd = MilterCommand::from_u8(packet.command)
            .ok_or(MilterError::UnknownCommand(packet.command))?;
        crate::debugdaytimeln!(
            "[{}] コマンド受信: {} (0x{:02X}) size={} phase={}",
            self.ctx.session_id(),
            cmd.as_str(),
            packet.command,
            packet.payload.len(),
            self.phase.as_str()
        );

        if cmd == MilterCommand::OptNeg {
            return self.negotiate(&packet.payload).await;
        }
        // 交渉前のコマンドは順序違反
        let mask = match self.mask {
            Some(mask) => mask,
            None => return Err(out_of_order(self.phase, cmd)),
        };

        match cmd {
            MilterCommand::Macro => {
                let stage = self.ctx.macros.apply_packet(&packet.payload)?;
                crate::debugdaytimeln!("[{}] マクロ定義: {}", self.ctx.session_id(), stage.as_str());
                Ok(Step::none())
            }
            MilterCommand::Abort => {
                self.abort().await;
                Ok(Step::none())
            }
            MilterCommand::Quit => Ok(Step {
                replies: Vec::new(),
                close: true,
            }),
            MilterCommand::QuitNc => {
                self.reset_connection();
                Ok(Step::none())
            }
            MilterCommand::Unknown => self.unknown(&mask, &packet.payload).await,
            _ => self.advance(&mask, cmd, &packet.payload).await,
        }
    }

    /// 接続終了時のdisconnect呼び出し（2回目以降は何もしない）
    pub async fn disconnect(&mut self) {
        if self.disconnected {
            return;
        }
        self.disconnected = true;
        self.handler.disconnect().await;
    }

    // --- SMFIC_OPTNEG ---
    async fn negotiate(&mut self, payload: &[u8]) -> Result<Step, MilterError> {
        if self.phase != Phase::AwaitingOptions {
            return Err(out_of_order(self.phase, MilterCommand::OptNeg));
        }
        let (mask, reply) = self.negotiator.negotiate(payload)?;
        self.mask = Some(mask);
        self.ctx.modifier.set_allowed(mask.actions);
        self.phase = Phase::Negotiated;
        self.conn_phase = Phase::Negotiated;
        self.handler.init(&self.ctx.session_id, "").await;
        Ok(Step::reply(reply))
    }

    // --- SMFIC_ABORT: メッセージ単位の状態を捨てて接続フェーズへ戻る ---
    async fn abort(&mut self) {
        if self.phase.in_message() && self.halted.is_none() {
            self.handler.abort(&mut self.ctx).await;
        }
        self.end_message();
        self.phase = self.conn_phase;
    }

    // --- SMFIC_QUIT_NC: 同じ接続で新しいSMTPセッションを受け付ける ---
    fn reset_connection(&mut self) {
        self.mask = None;
        self.phase = Phase::AwaitingOptions;
        self.conn_phase = Phase::AwaitingOptions;
        self.ctx = Context::new(Ulid::new().to_string());
        self.halted = None;
        self.connection_halted = false;
        crate::printdaytimeln!("SMFIC_QUIT_NC: 新セッション {}", self.ctx.session_id());
    }

    // メッセージ開始（MAIL FROMまたはその省略時の最初のメッセージ手順）
    async fn start_message(&mut self) {
        let message_id = self
            .ctx
            .macros
            .get("i")
            .map(str::to_string)
            .unwrap_or_else(|| Ulid::new().to_string());
        self.ctx.message_id = Some(message_id);
        let message_id = self.ctx.message_id.as_deref().unwrap_or_default();
        self.handler.init(&self.ctx.session_id, message_id).await;
    }

    // メッセージ終了（本文終了・中断・次メッセージ開始）
    fn end_message(&mut self) {
        self.ctx.reset_message();
        if !self.connection_halted {
            self.halted = None;
        }
    }

    // ドレイン中の応答（Repeatなら決定を再送）
    fn drain_reply(&self, mask: &FeatureMask, cmd: MilterCommand) -> Result<Step, MilterError> {
        match (&self.halted, mask.drain) {
            (Some(response), DrainPolicy::Repeat) if !mask.is_no_reply(cmd) => {
                Ok(Step::reply(encode_decision(response)?))
            }
            _ => Ok(Step::none()),
        }
    }

    // --- SMFIC_UNKNOWN: フェーズは進めない ---
    async fn unknown(&mut self, mask: &FeatureMask, payload: &[u8]) -> Result<Step, MilterError> {
        let cmd = MilterCommand::Unknown;
        if self.halted.is_some() {
            return self.drain_reply(mask, cmd);
        }
        let line = decode_unknown(payload);
        let response = if mask.is_skipped(cmd) {
            Response::Continue
        } else {
            self.handler.unknown(&mut self.ctx, &line).await?
        };
        self.reply_for(mask, cmd, &response)
    }

    // 決定を応答パケットにする（応答不要手順のCONTINUEは送らない）
    fn reply_for(
        &self,
        mask: &FeatureMask,
        cmd: MilterCommand,
        response: &Response,
    ) -> Result<Step, MilterError> {
        if !response.is_terminal() && mask.is_no_reply(cmd) {
            return Ok(Step::none());
        }
        Ok(Step::reply(encode_decision(response)?))
    }

    // ドレイン中に次メッセージの開始とみなすコマンドか
    //
    // 現フェーズからは進めず、接続フェーズからならメッセージ内へ進めるもの
    // （通常はMAIL FROM、MAILを省略した交渉ではRCPTなど）。
    fn starts_next_message(&self, mask: &FeatureMask, cmd: MilterCommand) -> bool {
        self.halted.is_some()
            && !self.connection_halted
            && self.phase.in_message()
            && next_phase(self.phase, cmd, mask.skipped).is_none()
            && next_phase(self.conn_phase, cmd, mask.skipped).is_some_and(Phase::in_message)
    }

    // --- フェーズを進めるコマンド ---
    async fn advance(
        &mut self,
        mask: &FeatureMask,
        cmd: MilterCommand,
        payload: &[u8],
    ) -> Result<Step, MilterError> {
        if self.starts_next_message(mask, cmd) {
            // 直前に届いた新メッセージ分のマクロは残す
            let stage = MacroStage::from_u8(cmd.as_u8());
            let new_macros = self.ctx.macros.stage(stage).to_vec();
            self.end_message();
            self.ctx.macros.replace_stage(stage, new_macros);
            self.phase = self.conn_phase;
        }

        let next = next_phase(self.phase, cmd, mask.skipped)
            .ok_or_else(|| out_of_order(self.phase, cmd))?;
        if !self.phase.in_message() && next.in_message() && self.halted.is_none() {
            self.start_message().await;
        }
        self.phase = next;
        if next.is_connection_level() {
            self.conn_phase = next;
        }

        // 決定済みならコールバックを呼ばずに読み捨てる
        if self.halted.is_some() {
            let step = self.drain_reply(mask, cmd);
            if next == Phase::EndOfBody {
                self.end_message();
            }
            return step;
        }

        if cmd == MilterCommand::BodyEob {
            return self.end_of_body().await;
        }

        let skipped = mask.is_skipped(cmd);
        let response = match cmd {
            MilterCommand::Connect => {
                let info = decode_connect(payload)?;
                crate::printdaytimeln!(
                    "[{}] 接続情報: host={} family={} port={} addr={}",
                    self.ctx.session_id(),
                    info.host,
                    info.family,
                    info.port,
                    info.address
                );
                if skipped {
                    Response::Continue
                } else {
                    self.handler
                        .connect(&mut self.ctx, &info.host, info.family, info.port, &info.address)
                        .await?
                }
            }
            MilterCommand::Helo => {
                let name = decode_helo(payload)?;
                if skipped {
                    Response::Continue
                } else {
                    self.handler.helo(&mut self.ctx, &name).await?
                }
            }
            MilterCommand::Mail => {
                let envelope = decode_envelope(cmd.as_str(), payload)?;
                if skipped {
                    Response::Continue
                } else {
                    self.handler.mail_from(&mut self.ctx, &envelope.address).await?
                }
            }
            MilterCommand::Rcpt => {
                let envelope = decode_envelope(cmd.as_str(), payload)?;
                if skipped {
                    Response::Continue
                } else {
                    self.handler.rcpt_to(&mut self.ctx, &envelope.address).await?
                }
            }
            MilterCommand::Data => {
                if skipped {
                    Response::Continue
                } else {
                    self.handler.data(&mut self.ctx).await?
                }
            }
            MilterCommand::Header => {
                let (name, value) = decode_header(payload)?;
                self.ctx.headers.push(name.clone(), value.clone());
                if skipped {
                    Response::Continue
                } else {
                    self.handler.header(&mut self.ctx, &name, &value).await?
                }
            }
            MilterCommand::Eoh => {
                if skipped {
                    Response::Continue
                } else {
                    self.handler.headers(&mut self.ctx).await?
                }
            }
            MilterCommand::Body => {
                if skipped {
                    Response::Continue
                } else {
                    self.handler.body_chunk(&mut self.ctx, payload).await?
                }
            }
            _ => return Err(out_of_order(self.phase, cmd)),
        };

        if response.is_terminal() {
            crate::printdaytimeln!(
                "[{}] 決定: {} at {}",
                self.ctx.session_id(),
                response.as_str(),
                self.phase.as_str()
            );
            // 応答テキストの誤りはここで検出（決定として保持しない）
            let step = self.reply_for(mask, cmd, &response)?;
            if self.phase.is_connection_level() {
                self.connection_halted = true;
            }
            self.halted = Some(response);
            return Ok(step);
        }
        self.reply_for(mask, cmd, &response)
    }

    // --- SMFIC_BODYEOB: 修正アクション → 最終応答 の順に送る ---
    async fn end_of_body(&mut self) -> Result<Step, MilterError> {
        self.ctx.modifier.open_window();
        let result = self.handler.body(&mut self.ctx).await;
        let actions = self.ctx.modifier.close_window();
        let response = result?;

        let mut replies = Vec::new();
        for action in &actions {
            crate::debugdaytimeln!("[{}] 修正アクション: {}", self.ctx.session_id(), action.as_str());
            replies.extend(encode_modification(action));
        }
        replies.push(encode_decision(&response)?);
        crate::printdaytimeln!(
            "[{}] 本文終了: 修正{}件 決定={}",
            self.ctx.session_id(),
            actions.len(),
            response.as_str()
        );
        self.end_message();
        Ok(Step {
            replies,
            close: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::milter::AddressFamily;
    use crate::milter_command::ActionFlags;
    use crate::negotiate::OptNeg;
    use async_trait::async_trait;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
        reject_rcpt: Option<String>,
        accept_at_connect: bool,
        misuse_in_header: bool,
        body_header: Option<(String, String)>,
    }

    #[async_trait]
    impl Milter for Recorder {
        async fn init(&mut self, _session_id: &str, message_id: &str) {
            self.calls.push(format!("init:{}", message_id));
        }

        async fn connect(
            &mut self,
            _ctx: &mut Context,
            host: &str,
            _family: AddressFamily,
            port: u16,
            _address: &str,
        ) -> Result<Response, MilterError> {
            self.calls.push(format!("connect:{}:{}", host, port));
            if self.accept_at_connect {
                return Ok(Response::Accept);
            }
            Ok(Response::Continue)
        }

        async fn helo(&mut self, _ctx: &mut Context, name: &str) -> Result<Response, MilterError> {
            self.calls.push(format!("helo:{}", name));
            Ok(Response::Continue)
        }

        async fn mail_from(&mut self, _ctx: &mut Context, address: &str) -> Result<Response, MilterError> {
            self.calls.push(format!("mail:{}", address));
            Ok(Response::Continue)
        }

        async fn rcpt_to(&mut self, _ctx: &mut Context, address: &str) -> Result<Response, MilterError> {
            self.calls.push(format!("rcpt:{}", address));
            match &self.reject_rcpt {
                Some(bad) if bad == address => Ok(Response::reject_with("550 5.7.1 blocked")),
                _ => Ok(Response::Continue),
            }
        }

        async fn header(&mut self, ctx: &mut Context, name: &str, _value: &str) -> Result<Response, MilterError> {
            self.calls.push(format!("header:{}", name));
            if self.misuse_in_header {
                ctx.add_header("X-Early", "1")?;
            }
            Ok(Response::Continue)
        }

        async fn headers(&mut self, ctx: &mut Context) -> Result<Response, MilterError> {
            self.calls.push(format!("headers:{}", ctx.headers().len()));
            Ok(Response::Continue)
        }

        async fn body_chunk(&mut self, _ctx: &mut Context, chunk: &[u8]) -> Result<Response, MilterError> {
            self.calls.push(format!("chunk:{}", chunk.len()));
            Ok(Response::Continue)
        }

        async fn body(&mut self, ctx: &mut Context) -> Result<Response, MilterError> {
            self.calls.push("body".to_string());
            if let Some((name, value)) = &self.body_header {
                ctx.add_header(name, value)?;
            }
            Ok(Response::Accept)
        }

        async fn unknown(&mut self, _ctx: &mut Context, command: &str) -> Result<Response, MilterError> {
            self.calls.push(format!("unknown:{}", command));
            Ok(Response::Continue)
        }

        async fn abort(&mut self, _ctx: &mut Context) {
            self.calls.push("abort".to_string());
        }

        async fn disconnect(&mut self) {
            self.calls.push("disconnect".to_string());
        }
    }

    fn optneg(version: u32) -> Packet {
        OptNeg {
            version,
            actions: ActionFlags::from_bits(0x7F),
            protocol: ProtocolFlags::from_bits(0x1F_FFFF),
        }
        .to_packet()
    }

    fn session(recorder: Recorder, actions: ActionFlags, skip: ProtocolFlags) -> Session<Recorder> {
        Session::new(recorder, Negotiator::new(actions, skip))
    }

    fn pkt(cmd: u8, payload: &[u8]) -> Packet {
        Packet::new(cmd, payload.to_vec())
    }

    fn connect_pkt() -> Packet {
        pkt(b'C', b"mail.example.com\x004\x00\x19203.0.113.5\0")
    }

    async fn run(s: &mut Session<Recorder>, packets: Vec<Packet>) -> Vec<u8> {
        let mut tags = Vec::new();
        for p in packets {
            let step = s.process(p).await.unwrap();
            tags.extend(step.replies.iter().map(|r| r.command));
        }
        tags
    }

    #[test]
    fn table_rejects_unlisted_pairs() {
        assert_eq!(transition(Phase::Negotiated, MilterCommand::Connect), Some(Phase::Connect));
        assert_eq!(transition(Phase::Helo, MilterCommand::Rcpt), None);
        assert_eq!(transition(Phase::BodyChunk, MilterCommand::Header), None);
        assert_eq!(transition(Phase::EndOfBody, MilterCommand::Mail), Some(Phase::MailFrom));
    }

    #[test]
    fn skipped_steps_are_passed_through() {
        let none = ProtocolFlags::empty();
        assert_eq!(next_phase(Phase::Negotiated, MilterCommand::Helo, none), None);
        assert_eq!(
            next_phase(Phase::Negotiated, MilterCommand::Helo, ProtocolFlags::NO_CONNECT),
            Some(Phase::Helo)
        );
        assert_eq!(
            next_phase(
                Phase::Negotiated,
                MilterCommand::Mail,
                ProtocolFlags::NO_CONNECT | ProtocolFlags::NO_HELO
            ),
            Some(Phase::MailFrom)
        );
        assert_eq!(next_phase(Phase::MailFrom, MilterCommand::Header, none), None);
        assert_eq!(
            next_phase(Phase::MailFrom, MilterCommand::Header, ProtocolFlags::NO_RCPT),
            Some(Phase::Header)
        );
        assert_eq!(
            next_phase(Phase::Header, MilterCommand::BodyEob, ProtocolFlags::NO_EOH),
            Some(Phase::EndOfBody)
        );
    }

    #[tokio::test]
    async fn full_message_flow_with_modification() {
        let recorder = Recorder {
            body_header: Some(("X-Filtered".into(), "yes".into())),
            ..Recorder::default()
        };
        let mut s = session(recorder, ActionFlags::ADD_HEADERS, ProtocolFlags::empty());
        let tags = run(
            &mut s,
            vec![
                optneg(6),
                pkt(b'D', b"Cj\0mx.example.com\0"),
                connect_pkt(),
                pkt(b'H', b"mail.example.com\0"),
                pkt(b'D', b"Mi\0QID42\0"),
                pkt(b'M', b"<a@example.com>\0"),
                pkt(b'R', b"<b@example.com>\0"),
                pkt(b'L', b"Subject\0Hi\0"),
                pkt(b'L', b"From\0a@example.com\0"),
                pkt(b'N', b""),
                pkt(b'B', b"hello"),
                pkt(b'E', b""),
            ],
        )
        .await;
        let mut expected = vec![b'O'];
        expected.extend([b'c'; 8]);
        expected.extend(b"ha");
        assert_eq!(tags, expected);
        assert_eq!(
            s.handler().calls,
            vec![
                "init:",
                "connect:mail.example.com:25",
                "helo:mail.example.com",
                "init:QID42",
                "mail:<a@example.com>",
                "rcpt:<b@example.com>",
                "header:Subject",
                "header:From",
                "headers:2",
                "chunk:5",
                "body",
            ]
        );
        assert_eq!(s.phase(), Phase::EndOfBody);
        assert!(s.context().headers().is_empty());
        assert_eq!(s.context().macro_value("j"), Some("mx.example.com"));
    }

    #[tokio::test]
    async fn commands_before_negotiation_are_out_of_order() {
        let mut s = session(Recorder::default(), ActionFlags::empty(), ProtocolFlags::empty());
        let err = s.process(connect_pkt()).await.unwrap_err();
        assert!(matches!(err, MilterError::OutOfOrder { phase: "AwaitingOptions", .. }));
        let err = s.process(pkt(b'D', b"Cj\0x\0")).await.unwrap_err();
        assert!(matches!(err, MilterError::OutOfOrder { .. }));
    }

    #[tokio::test]
    async fn unexpected_command_is_fatal() {
        let mut s = session(Recorder::default(), ActionFlags::empty(), ProtocolFlags::empty());
        run(&mut s, vec![optneg(6), connect_pkt()]).await;
        let err = s.process(pkt(b'L', b"Subject\0Hi\0")).await.unwrap_err();
        assert!(matches!(
            err,
            MilterError::OutOfOrder {
                phase: "Connect",
                command: "SMFIC_HEADER"
            }
        ));
        let err = s.process(pkt(b'Z', b"")).await.unwrap_err();
        assert!(matches!(err, MilterError::UnknownCommand(b'Z')));
    }

    #[tokio::test]
    async fn reject_drains_rest_of_message() {
        let recorder = Recorder {
            reject_rcpt: Some("<spam@bad.tld>".into()),
            ..Recorder::default()
        };
        let mut s = session(recorder, ActionFlags::empty(), ProtocolFlags::empty());
        run(
            &mut s,
            vec![optneg(6), connect_pkt(), pkt(b'H', b"h\0"), pkt(b'M', b"<a@x>\0")],
        )
        .await;
        let step = s.process(pkt(b'R', b"<spam@bad.tld>\0")).await.unwrap();
        assert_eq!(step.replies, vec![Packet::new(b'y', b"550 5.7.1 blocked\0".to_vec())]);
        assert!(s.is_draining());

        // v6は決定を再送する
        let step = s.process(pkt(b'L', b"Subject\0x\0")).await.unwrap();
        assert_eq!(step.replies[0].command, b'y');
        run(&mut s, vec![pkt(b'N', b""), pkt(b'B', b"x"), pkt(b'E', b"")]).await;
        assert!(!s.is_draining());
        let calls = &s.handler().calls;
        assert!(!calls.iter().any(|c| c.starts_with("header") || c == "body" || c.starts_with("chunk")));

        // 次のメッセージは通常処理
        run(&mut s, vec![pkt(b'M', b"<c@x>\0")]).await;
        assert_eq!(s.handler().calls.last().map(String::as_str), Some("mail:<c@x>"));
    }

    #[tokio::test]
    async fn silent_drain_for_old_versions() {
        let recorder = Recorder {
            reject_rcpt: Some("<spam@bad.tld>".into()),
            ..Recorder::default()
        };
        let mut s = session(recorder, ActionFlags::empty(), ProtocolFlags::empty());
        run(
            &mut s,
            vec![optneg(2), connect_pkt(), pkt(b'M', b"<a@x>\0"), pkt(b'R', b"<spam@bad.tld>\0")],
        )
        .await;
        let step = s.process(pkt(b'R', b"<ok@x>\0")).await.unwrap();
        assert!(step.replies.is_empty());
        // 新しいMAIL FROMで次メッセージへ
        let tags = run(&mut s, vec![pkt(b'M', b"<b@x>\0")]).await;
        assert_eq!(tags, vec![b'c']);
        assert!(!s.is_draining());
    }

    #[tokio::test]
    async fn abort_resets_message_state() {
        let mut s = session(Recorder::default(), ActionFlags::empty(), ProtocolFlags::empty());
        run(
            &mut s,
            vec![
                optneg(6),
                connect_pkt(),
                pkt(b'H', b"h\0"),
                pkt(b'M', b"<a@x>\0"),
                pkt(b'R', b"<b@x>\0"),
                pkt(b'L', b"Subject\0x\0"),
            ],
        )
        .await;
        assert_eq!(s.context().headers().len(), 1);
        let step = s.process(pkt(b'A', b"")).await.unwrap();
        assert!(step.replies.is_empty());
        assert_eq!(s.phase(), Phase::Helo);
        assert!(s.context().headers().is_empty());
        assert!(s.handler().calls.contains(&"abort".to_string()));
        run(&mut s, vec![pkt(b'M', b"<c@x>\0")]).await;
    }

    #[tokio::test]
    async fn accept_at_connect_halts_connection() {
        let recorder = Recorder {
            accept_at_connect: true,
            ..Recorder::default()
        };
        let mut s = session(recorder, ActionFlags::empty(), ProtocolFlags::empty());
        let tags = run(&mut s, vec![optneg(6), connect_pkt()]).await;
        assert_eq!(tags, b"Oa".to_vec());
        run(
            &mut s,
            vec![pkt(b'H', b"h\0"), pkt(b'M', b"<a@x>\0"), pkt(b'A', b""), pkt(b'M', b"<b@x>\0")],
        )
        .await;
        assert!(s.is_draining());
        assert!(!s.handler().calls.iter().any(|c| c.starts_with("mail")));
    }

    #[tokio::test]
    async fn skipped_callbacks_are_not_invoked() {
        let mut s = session(
            Recorder::default(),
            ActionFlags::empty(),
            ProtocolFlags::NO_BODY | ProtocolFlags::NO_HELO,
        );
        // MTAが省略しなかった場合もコールバックは呼ばない
        let tags = run(
            &mut s,
            vec![
                optneg(6),
                connect_pkt(),
                pkt(b'H', b"h\0"),
                pkt(b'M', b"<a@x>\0"),
                pkt(b'R', b"<b@x>\0"),
                pkt(b'N', b""),
                pkt(b'B', b"chunk"),
                pkt(b'E', b""),
            ],
        )
        .await;
        assert_eq!(tags, b"Occcccca".to_vec());
        let calls = &s.handler().calls;
        assert!(!calls.iter().any(|c| c.starts_with("helo") || c.starts_with("chunk")));
        assert!(calls.contains(&"body".to_string()));
    }

    #[tokio::test]
    async fn modification_outside_end_of_body_is_misuse() {
        let recorder = Recorder {
            misuse_in_header: true,
            ..Recorder::default()
        };
        let mut s = session(recorder, ActionFlags::ADD_HEADERS, ProtocolFlags::empty());
        run(
            &mut s,
            vec![optneg(6), connect_pkt(), pkt(b'M', b"<a@x>\0"), pkt(b'R', b"<b@x>\0")],
        )
        .await;
        let err = s.process(pkt(b'L', b"Subject\0x\0")).await.unwrap_err();
        assert!(matches!(err, MilterError::ModificationOutsideWindow { .. }));
    }

    #[tokio::test]
    async fn undeclared_action_at_end_of_body_is_misuse() {
        let recorder = Recorder {
            body_header: Some(("X-A".into(), "1".into())),
            ..Recorder::default()
        };
        let mut s = session(recorder, ActionFlags::empty(), ProtocolFlags::empty());
        run(
            &mut s,
            vec![optneg(6), connect_pkt(), pkt(b'M', b"<a@x>\0"), pkt(b'R', b"<b@x>\0"), pkt(b'N', b"")],
        )
        .await;
        let err = s.process(pkt(b'E', b"")).await.unwrap_err();
        assert!(matches!(err, MilterError::ActionNotNegotiated { .. }));
    }

    #[tokio::test]
    async fn no_reply_steps_send_nothing_on_continue() {
        let mut s = session(Recorder::default(), ActionFlags::empty(), ProtocolFlags::NR_HEADER);
        run(
            &mut s,
            vec![optneg(6), connect_pkt(), pkt(b'M', b"<a@x>\0"), pkt(b'R', b"<b@x>\0")],
        )
        .await;
        let step = s.process(pkt(b'L', b"Subject\0x\0")).await.unwrap();
        assert!(step.replies.is_empty());
    }

    #[tokio::test]
    async fn quit_closes_and_quit_nc_renegotiates() {
        let mut s = session(Recorder::default(), ActionFlags::empty(), ProtocolFlags::empty());
        run(&mut s, vec![optneg(6), connect_pkt()]).await;
        let first_id = s.session_id().to_string();
        assert!(s.process(pkt(b'K', b"")).await.unwrap().replies.is_empty());
        assert_eq!(s.phase(), Phase::AwaitingOptions);
        assert_ne!(s.session_id(), first_id);
        run(&mut s, vec![optneg(6), connect_pkt()]).await;
        let step = s.process(pkt(b'Q', b"")).await.unwrap();
        assert!(step.close);
    }

    #[tokio::test]
    async fn disconnect_runs_once() {
        let mut s = session(Recorder::default(), ActionFlags::empty(), ProtocolFlags::empty());
        s.disconnect().await;
        s.disconnect().await;
        let count = s.handler().calls.iter().filter(|c| *c == "disconnect").count();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn unknown_command_keeps_phase() {
        let mut s = session(Recorder::default(), ActionFlags::empty(), ProtocolFlags::empty());
        run(&mut s, vec![optneg(6), connect_pkt(), pkt(b'M', b"<a@x>\0")]).await;
        let step = s.process(pkt(b'U', b"XFOO bar\0")).await.unwrap();
        assert_eq!(step.replies, vec![Packet::empty(b'c')]);
        assert_eq!(s.phase(), Phase::MailFrom);
        assert_eq!(s.handler().calls.last().map(String::as_str), Some("unknown:XFOO bar"));
        // メッセージ内でもそのまま続けられる
        run(&mut s, vec![pkt(b'R', b"<b@x>\0")]).await;
        assert_eq!(s.phase(), Phase::RcptTo);
    }

    #[tokio::test]
    async fn unknown_command_can_be_skipped_or_unanswered() {
        let mut s = session(Recorder::default(), ActionFlags::empty(), ProtocolFlags::NO_UNKNOWN);
        run(&mut s, vec![optneg(6), connect_pkt()]).await;
        let step = s.process(pkt(b'U', b"XFOO\0")).await.unwrap();
        assert_eq!(step.replies, vec![Packet::empty(b'c')]);
        assert!(!s.handler().calls.iter().any(|c| c.starts_with("unknown")));
        assert_eq!(s.phase(), Phase::Connect);

        let mut s = session(Recorder::default(), ActionFlags::empty(), ProtocolFlags::NR_UNKNOWN);
        run(&mut s, vec![optneg(6), connect_pkt()]).await;
        let step = s.process(pkt(b'U', b"XFOO\0")).await.unwrap();
        assert!(step.replies.is_empty());
        assert!(s.handler().calls.contains(&"unknown:XFOO".to_string()));
        assert_eq!(s.phase(), Phase::Connect);
    }

    #[tokio::test]
    async fn next_mail_after_drain_keeps_its_macros() {
        let recorder = Recorder {
            reject_rcpt: Some("<spam@bad.tld>".into()),
            ..Recorder::default()
        };
        let mut s = session(recorder, ActionFlags::empty(), ProtocolFlags::empty());
        run(
            &mut s,
            vec![
                optneg(6),
                connect_pkt(),
                pkt(b'D', b"Mi\0Q1\0"),
                pkt(b'M', b"<a@x>\0"),
                pkt(b'R', b"<spam@bad.tld>\0"),
            ],
        )
        .await;
        assert!(s.is_draining());
        run(&mut s, vec![pkt(b'D', b"Mi\0Q2\0"), pkt(b'M', b"<c@x>\0")]).await;
        assert!(!s.is_draining());
        assert_eq!(s.context().message_id(), Some("Q2"));
        let calls = &s.handler().calls;
        assert_eq!(&calls[calls.len() - 2..], ["init:Q2", "mail:<c@x>"]);
    }

    #[tokio::test]
    async fn drain_ends_at_first_step_of_next_message_without_mail() {
        let recorder = Recorder {
            reject_rcpt: Some("<spam@bad.tld>".into()),
            ..Recorder::default()
        };
        let mut s = session(recorder, ActionFlags::empty(), ProtocolFlags::NO_MAIL);
        run(&mut s, vec![optneg(2), connect_pkt(), pkt(b'R', b"<spam@bad.tld>\0")]).await;
        assert!(s.is_draining());
        // 同じメッセージの続きは読み捨て
        let tags = run(&mut s, vec![pkt(b'R', b"<ok@x>\0"), pkt(b'N', b"")]).await;
        assert!(tags.is_empty());
        // MAILが来ないので次のRCPTが新メッセージの開始
        let step = s.process(pkt(b'R', b"<next@x>\0")).await.unwrap();
        assert_eq!(step.replies, vec![Packet::empty(b'c')]);
        assert!(!s.is_draining());
        assert_eq!(s.phase(), Phase::RcptTo);
        assert_eq!(s.handler().calls.last().map(String::as_str), Some("rcpt:<next@x>"));
    }

    #[tokio::test]
    async fn second_negotiation_is_out_of_order() {
        let mut s = session(Recorder::default(), ActionFlags::empty(), ProtocolFlags::empty());
        run(&mut s, vec![optneg(6)]).await;
        let err = s.process(optneg(6)).await.unwrap_err();
        assert!(matches!(err, MilterError::OutOfOrder { command: "SMFIC_OPTNEG", .. }));
    }
}
