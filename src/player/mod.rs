// 流控制：标记、同步对象、读包线程、解码器与输出

pub mod markers;
pub mod sync_object;
pub mod packet_feeder;
pub mod codec;
pub mod audio_decoder;
pub mod video_decoder;
pub mod audio_output;
pub mod stream_controller;
pub mod synthetic;

pub use markers::{AudioMarkers, ClockRebaseList, MarkerKind, MarkerList, MarkerPayload, PositionMarker};
pub use sync_object::{AudioMaster, SyncMaster, SyncObject, SyncSlave, UserSync, VideoSlave, WallClockMaster};
pub use packet_feeder::{Demuxer, MediaPacket, PacketFeeder, PacketQueue, QueueItem, SeekHandle};
pub use codec::{AudioCodec, DecodedFrame, VideoCodec};
pub use audio_decoder::{AudioHandle, AudioStream};
pub use video_decoder::{
    FrameBuffer, FrameSink, GetBufferMethod, GlrMethod, SharedFrameBuffer, VideoHandle, VideoStream, VideoWaker,
};
pub use audio_output::PacedOutput;
#[cfg(feature = "cpal-output")]
pub use audio_output::DeviceOutput;
pub use stream_controller::{MediaHandles, StreamController};
pub use synthetic::{MemoryFrameSink, SyntheticAudioCodec, SyntheticDemuxer, SyntheticVideoCodec};
