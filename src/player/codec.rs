// 按包解码的接口，真正的解码器在引擎之外实现

use crate::core::Result;
use crate::player::packet_feeder::MediaPacket;

/// 把音频包解码为引擎采样率和声道数的交错 16 位有符号采样（含重采样）
pub trait AudioCodec: Send {
    fn decode(&mut self, packet: &MediaPacket) -> Result<Vec<i16>>;

    /// Seek 后丢弃内部状态
    fn flush(&mut self) {}

    fn description(&self) -> String {
        "audio codec".to_string()
    }
}

/// 解码好的画面，等待拷贝到输出槽
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub pts_ms: u32,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

pub trait VideoCodec: Send {
    /// 数据包不足以组成一帧时返回 `Ok(None)`
    fn decode(&mut self, packet: &MediaPacket) -> Result<Option<DecodedFrame>>;

    fn flush(&mut self) {}

    fn description(&self) -> String {
        "video codec".to_string()
    }
}
