// =========================
// packet.rs
// Milterパケットの送受信（長さプレフィックス付きフレーム）
//
// 【このファイルで使う主なクレート】
// - tokio: 非同期I/Oトレイト（io::AsyncReadExt, io::AsyncWriteExt）
// - crate::error: MilterError（切断・長さ0・長さ超過）
//
// 【役割】
// - 4バイト(ビッグエンディアン)長 + 1バイトコマンド + ペイロード の分解/組み立て
// - ペイロードの中身には関知しない（NUL終端文字列などは上位層の責務）
// =========================

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::MilterError;

/// 本文チャンク・本文置換パケットのペイロード上限（libmilter互換 64KiB-1）
pub const MILTER_CHUNK_SIZE: usize = 65535;

/// 受信パケット長の既定上限（コマンド+ペイロード, 1MiB本文チャンクを許容）
pub const DEFAULT_MAX_PACKET_SIZE: usize = 0x10_0000 + 1;

/// Milterパケット（コマンド1バイト + ペイロード）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub command: u8,      // コマンド／応答バイト
    pub payload: Vec<u8>, // ペイロード（解釈は上位層）
}

impl Packet {
    pub fn new(command: u8, payload: Vec<u8>) -> Self {
        Packet { command, payload }
    }

    /// ペイロード無しのパケット（CONTINUE等）
    pub fn empty(command: u8) -> Self {
        Packet {
            command,
            payload: Vec::new(),
        }
    }

    /// ワイヤ形式へ変換（長さ4バイト + コマンド + ペイロード）
    pub fn encode(&self) -> Vec<u8> {
        let size = (self.payload.len() + 1) as u32; // コマンド1バイト分を含む
        let mut buf = Vec::with_capacity(5 + self.payload.len());
        buf.extend_from_slice(&size.to_be_bytes());
        buf.push(self.command);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// バッファ先頭から1パケット分を取り出す
    ///
    /// 戻り値: `Ok(Some((packet, 消費バイト数)))`、データ不足なら `Ok(None)`
    pub fn decode(buf: &[u8], max_len: usize) -> Result<Option<(Packet, usize)>, MilterError> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let size = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        check_size(size, max_len)?;
        if buf.len() < 4 + size {
            return Ok(None);
        }
        let packet = Packet {
            command: buf[4],
            payload: buf[5..4 + size].to_vec(),
        };
        Ok(Some((packet, 4 + size)))
    }
}

// 長さ0・長さ超過はどちらも接続を継続できない
fn check_size(size: usize, max_len: usize) -> Result<(), MilterError> {
    if size == 0 {
        return Err(MilterError::ZeroLength);
    }
    if size > max_len {
        return Err(MilterError::Oversized { len: size, max: max_len });
    }
    Ok(())
}

/// ストリームから1パケット受信
///
/// - 長さプレフィックスの受信前に切断された場合は `Ok(None)`（正常終了）
/// - 途中で切断された場合は `ShortRead`
pub async fn read_packet<R>(reader: &mut R, max_len: usize) -> Result<Option<Packet>, MilterError>
where
    R: AsyncRead + Unpin,
{
    // --- フェーズ1: 4バイト長の受信 ---
    let mut header = [0u8; 4];
    let mut read_bytes = 0; // 受信済みバイト数
    while read_bytes < 4 {
        let n = reader.read(&mut header[read_bytes..]).await?;
        if n == 0 {
            if read_bytes == 0 {
                return Ok(None); // パケット境界での切断
            }
            return Err(MilterError::ShortRead {
                expected: 4,
                received: read_bytes,
            });
        }
        read_bytes += n;
    }
    let size = u32::from_be_bytes(header) as usize;
    check_size(size, max_len)?;

    // --- フェーズ2: コマンド + ペイロードの受信 ---
    let mut body = vec![0u8; size];
    let mut received = 0;
    while received < size {
        let n = reader.read(&mut body[received..]).await?;
        if n == 0 {
            return Err(MilterError::ShortRead {
                expected: size,
                received,
            });
        }
        received += n;
    }
    let command = body[0];
    body.remove(0);
    Ok(Some(Packet {
        command,
        payload: body,
    }))
}

/// ストリームへ1パケット送信
pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<(), MilterError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&packet.encode()).await?;
    Ok(())
}
