use crate::core::error::CodecError;
use crate::core::types::{AudioFrame, PixelFormat, SampleFormat, Time, VideoFrame};
use crate::player::codec::{
    CodecBackend, Container, DecodedFrame, Decoder, MediaIo, MediaKind, Packet, Rational, StreamInfo,
};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;
use ffmpeg_next::{codec, format, media, software, util};
use log::{debug, info, warn};
use std::io::SeekFrom;
use std::os::raw::{c_int, c_void};
use std::{process, ptr, thread};

/// AVIO 缓冲区大小
const IO_BUFFER_SIZE: usize = 64 * 1024;

/// 帧率未知时的视频帧时长（毫秒）
const DEFAULT_FRAME_DURATION: Time = 40;

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

fn map_error(error: ffmpeg::Error) -> CodecError {
    match error {
        ffmpeg::Error::Eof => CodecError::EndOfFile,
        ffmpeg::Error::Other { errno: 11 } => CodecError::Again, // EAGAIN
        ffmpeg::Error::InvalidData => CodecError::InvalidData,
        other => CodecError::Fatal(other.to_string()),
    }
}

fn to_rational(value: ffmpeg::Rational) -> Rational {
    Rational::new(value.numerator(), value.denominator())
}

/// 基于 FFmpeg 的编解码能力，字节通过自定义 AVIO 从 MediaIo 读取
pub struct FfmpegBackend;

impl FfmpegBackend {
    pub fn new() -> Result<Self, CodecError> {
        ffmpeg::init().map_err(map_error)?;
        info!("{} ✅ FFmpeg 初始化完成", log_ctx());
        Ok(Self)
    }
}

impl CodecBackend for FfmpegBackend {
    fn open(&self, io: Box<dyn MediaIo>) -> Result<Box<dyn Container>, CodecError> {
        let io = IoContext::new(io)?;
        let input = unsafe {
            let mut context = ffi::avformat_alloc_context();
            if context.is_null() {
                return Err(CodecError::Fatal("avformat_alloc_context 失败".to_string()));
            }
            (*context).pb = io.avio;
            (*context).flags |= ffi::AVFMT_FLAG_CUSTOM_IO as c_int;

            // 失败时 FFmpeg 会释放 context
            let ret = ffi::avformat_open_input(&mut context, ptr::null(), ptr::null(), ptr::null_mut());
            if ret < 0 {
                return Err(map_error(ffmpeg::Error::from(ret)));
            }
            let ret = ffi::avformat_find_stream_info(context, ptr::null_mut());
            if ret < 0 {
                ffi::avformat_close_input(&mut context);
                return Err(map_error(ffmpeg::Error::from(ret)));
            }
            format::context::Input::wrap(context)
        };

        let streams = input.streams().map(|stream| describe_stream(&stream)).collect::<Vec<_>>();
        info!(
            "{} 📂 FFmpeg 打开容器: {} ({} 路流)",
            log_ctx(),
            input.format().name(),
            streams.len()
        );
        Ok(Box::new(FfmpegContainer { input, _io: io, streams }))
    }
}

/// 自定义 AVIO 上下文，持有 MediaIo
struct IoContext {
    avio: *mut ffi::AVIOContext,
    opaque: *mut Box<dyn MediaIo>,
}

impl IoContext {
    fn new(io: Box<dyn MediaIo>) -> Result<Self, CodecError> {
        let opaque = Box::into_raw(Box::new(io));
        unsafe {
            let buffer = ffi::av_malloc(IO_BUFFER_SIZE) as *mut u8;
            if buffer.is_null() {
                drop(Box::from_raw(opaque));
                return Err(CodecError::Fatal("AVIO 缓冲区分配失败".to_string()));
            }
            let avio = ffi::avio_alloc_context(
                buffer,
                IO_BUFFER_SIZE as c_int,
                0,
                opaque as *mut c_void,
                Some(read_callback),
                None,
                Some(seek_callback),
            );
            if avio.is_null() {
                ffi::av_free(buffer as *mut c_void);
                drop(Box::from_raw(opaque));
                return Err(CodecError::Fatal("avio_alloc_context 失败".to_string()));
            }
            Ok(Self { avio, opaque })
        }
    }
}

impl Drop for IoContext {
    fn drop(&mut self) {
        unsafe {
            // 缓冲区可能被 FFmpeg 换过，以 AVIOContext 里的为准
            ffi::av_freep(&mut (*self.avio).buffer as *mut *mut u8 as *mut c_void);
            ffi::avio_context_free(&mut self.avio);
            drop(Box::from_raw(self.opaque));
        }
    }
}

unsafe extern "C" fn read_callback(opaque: *mut c_void, buf: *mut u8, size: c_int) -> c_int {
    let io = &mut *(opaque as *mut Box<dyn MediaIo>);
    let buffer = std::slice::from_raw_parts_mut(buf, size.max(0) as usize);
    match io.read(buffer) {
        Ok(0) => ffi::AVERROR_EOF,
        Ok(read) => read as c_int,
        Err(error) => {
            debug!("{} AVIO 读取失败: {}", log_ctx(), error);
            ffi::AVERROR_EXTERNAL
        }
    }
}

unsafe extern "C" fn seek_callback(opaque: *mut c_void, offset: i64, whence: c_int) -> i64 {
    let io = &mut *(opaque as *mut Box<dyn MediaIo>);
    let whence = whence & !(ffi::AVSEEK_FORCE as c_int);
    if whence == ffi::AVSEEK_SIZE as c_int {
        return io.size() as i64;
    }
    let target = match whence {
        0 => SeekFrom::Start(offset.max(0) as u64), // SEEK_SET
        1 => SeekFrom::Current(offset),             // SEEK_CUR
        2 => SeekFrom::End(offset),                 // SEEK_END
        _ => return -1,
    };
    match io.seek(target) {
        Ok(position) => position as i64,
        Err(_) => -1,
    }
}

/// 读取流参数（尺寸、像素格式需要解码器上下文才能拿到）
fn describe_stream(stream: &format::stream::Stream) -> StreamInfo {
    let kind = match stream.parameters().medium() {
        media::Type::Video => MediaKind::Video,
        media::Type::Audio => MediaKind::Audio,
        _ => MediaKind::Other,
    };
    let duration = stream.duration();
    let mut info = StreamInfo {
        index: stream.index(),
        kind,
        time_base: to_rational(stream.time_base()),
        duration: (duration > 0).then_some(duration),
        width: 0,
        height: 0,
        rotation: 0,
        alpha: false,
        sample_rate: 0,
        channels: 0,
    };
    let Ok(context) = codec::context::Context::from_parameters(stream.parameters()) else {
        return info;
    };
    match kind {
        MediaKind::Video => {
            if let Ok(decoder) = context.decoder().video() {
                info.width = decoder.width();
                info.height = decoder.height();
                info.alpha = matches!(
                    decoder.format(),
                    format::Pixel::YUVA420P
                        | format::Pixel::YUVA444P
                        | format::Pixel::RGBA
                        | format::Pixel::BGRA
                        | format::Pixel::ARGB
                        | format::Pixel::ABGR
                );
            }
            info.rotation = stream_rotation(stream);
        }
        MediaKind::Audio => {
            if let Ok(decoder) = context.decoder().audio() {
                info.sample_rate = decoder.rate();
                info.channels = decoder.channels();
            }
        }
        MediaKind::Other => {}
    }
    info
}

/// 显示矩阵里的旋转角度，归一到 0 / 90 / 180 / 270
fn stream_rotation(stream: &format::stream::Stream) -> i32 {
    for side_data in stream.side_data() {
        if !matches!(side_data.kind(), codec::packet::side_data::Type::DisplayMatrix) {
            continue;
        }
        let data = side_data.data();
        if data.len() < 9 * std::mem::size_of::<i32>() {
            continue;
        }
        let angle = unsafe { ffi::av_display_rotation_get(data.as_ptr() as *const i32) };
        if angle.is_nan() {
            return 0;
        }
        let degrees = (-angle).round() as i32;
        return ((degrees % 360) + 360) % 360 / 90 * 90;
    }
    0
}

/// FFmpeg 容器
///
/// 字段顺序决定析构顺序：先关闭 input，再释放 AVIO。
struct FfmpegContainer {
    input: format::context::Input,
    _io: IoContext,
    streams: Vec<StreamInfo>,
}

impl Container for FfmpegContainer {
    fn streams(&self) -> Vec<StreamInfo> {
        self.streams.clone()
    }

    fn best_stream(&self, kind: MediaKind) -> Option<usize> {
        let kind = match kind {
            MediaKind::Video => media::Type::Video,
            MediaKind::Audio => media::Type::Audio,
            MediaKind::Other => return None,
        };
        self.input.streams().best(kind).map(|stream| stream.index())
    }

    fn duration(&self) -> Option<Time> {
        let duration = self.input.duration();
        // AV_TIME_BASE 为微秒
        (duration > 0).then(|| duration / 1000)
    }

    fn open_decoder(&mut self, index: usize) -> Result<Box<dyn Decoder>, CodecError> {
        let stream = self
            .input
            .stream(index)
            .ok_or_else(|| CodecError::Fatal(format!("流 {} 不存在", index)))?;
        let time_base = to_rational(stream.time_base());
        let mut context = codec::context::Context::from_parameters(stream.parameters()).map_err(map_error)?;
        unsafe {
            (*context.as_mut_ptr()).pkt_timebase = stream.time_base().into();
        }
        match stream.parameters().medium() {
            media::Type::Video => {
                let decoder = context.decoder().video().map_err(map_error)?;
                let rate = stream.avg_frame_rate();
                let frame_duration = if rate.numerator() > 0 && rate.denominator() > 0 {
                    (1000 * rate.denominator() as i64 / rate.numerator() as i64).max(1)
                } else {
                    DEFAULT_FRAME_DURATION
                };
                debug!(
                    "{} 视频解码器: {}x{} {:?}, 帧时长 {}ms",
                    log_ctx(),
                    decoder.width(),
                    decoder.height(),
                    decoder.format(),
                    frame_duration
                );
                Ok(Box::new(FfmpegVideoDecoder {
                    decoder,
                    scaler: None,
                    time_base,
                    frame_duration,
                    draining: false,
                }))
            }
            media::Type::Audio => {
                let decoder = context.decoder().audio().map_err(map_error)?;
                let target_channels = decoder.channels().clamp(1, 2);
                debug!(
                    "{} 音频解码器: {} Hz, {} 声道 → f32 {} 声道",
                    log_ctx(),
                    decoder.rate(),
                    decoder.channels(),
                    target_channels
                );
                Ok(Box::new(FfmpegAudioDecoder {
                    decoder,
                    resampler: None,
                    time_base,
                    target_channels,
                    draining: false,
                }))
            }
            other => Err(CodecError::Fatal(format!("不支持的流类型 {:?}", other))),
        }
    }

    fn read_packet(&mut self) -> Result<Packet, CodecError> {
        loop {
            let mut packet = ffmpeg::Packet::empty();
            packet.read(&mut self.input).map_err(map_error)?;
            let Some(data) = packet.data() else {
                continue;
            };
            if data.is_empty() {
                continue;
            }
            return Ok(Packet {
                stream_index: packet.stream(),
                pts: packet.pts(),
                dts: packet.dts(),
                duration: packet.duration(),
                keyframe: packet.is_key(),
                data: data.to_vec(),
            });
        }
    }

    fn seek(&mut self, stream_index: usize, position: Time) -> Result<(), CodecError> {
        let time_base = self
            .streams
            .iter()
            .find(|info| info.index == stream_index)
            .map(|info| info.time_base)
            .ok_or_else(|| CodecError::Fatal(format!("流 {} 不存在", stream_index)))?;
        let timestamp = time_base.from_time(position);
        let ret = unsafe {
            ffi::av_seek_frame(
                self.input.as_mut_ptr(),
                stream_index as c_int,
                timestamp,
                ffi::AVSEEK_FLAG_BACKWARD as c_int,
            )
        };
        if ret < 0 {
            return Err(map_error(ffmpeg::Error::from(ret)));
        }
        Ok(())
    }
}

/// 把通用包转换为 FFmpeg 包
fn to_ffmpeg_packet(packet: &Packet) -> ffmpeg::Packet {
    let mut result = ffmpeg::Packet::copy(&packet.data);
    result.set_stream(packet.stream_index);
    result.set_pts(packet.pts);
    result.set_dts(packet.dts);
    result.set_duration(packet.duration);
    if packet.keyframe {
        result.set_flags(codec::packet::Flags::KEY);
    }
    result
}

/// 结束标记走 send_eof，其余包走 send_packet
fn send(decoder: &mut codec::decoder::Opened, packet: &Packet, draining: &mut bool) -> Result<(), CodecError> {
    if packet.is_end_of_stream() {
        if *draining {
            return Ok(());
        }
        *draining = true;
        return decoder.send_eof().map_err(map_error);
    }
    match decoder.send_packet(&to_ffmpeg_packet(packet)) {
        Ok(()) => Ok(()),
        Err(ffmpeg::Error::Eof) => {
            debug!("{} 解码器已在 drain 状态，忽略包", log_ctx());
            Ok(())
        }
        Err(error) => Err(map_error(error)),
    }
}

/// 视频解码器：输出统一转换为 RGBA
struct FfmpegVideoDecoder {
    decoder: codec::decoder::Video,
    scaler: Option<software::scaling::Context>,
    time_base: Rational,
    frame_duration: Time,
    draining: bool,
}

// SwsContext 只在持有解码器的线程中使用
unsafe impl Send for FfmpegVideoDecoder {}

impl FfmpegVideoDecoder {
    fn convert(&mut self, frame: &util::frame::Video) -> Result<VideoFrame, CodecError> {
        let (width, height) = (frame.width(), frame.height());
        let rebuild = match &self.scaler {
            Some(scaler) => {
                scaler.input().width != width
                    || scaler.input().height != height
                    || scaler.input().format != frame.format()
            }
            None => true,
        };
        if rebuild {
            debug!("{} 🔧 初始化缩放器: {}x{} {:?} → RGBA", log_ctx(), width, height, frame.format());
            self.scaler = Some(
                software::scaling::Context::get(
                    frame.format(),
                    width,
                    height,
                    format::Pixel::RGBA,
                    width,
                    height,
                    software::scaling::Flags::BILINEAR,
                )
                .map_err(map_error)?,
            );
        }
        let scaler = self
            .scaler
            .as_mut()
            .ok_or_else(|| CodecError::Fatal("缩放器未初始化".to_string()))?;

        let mut rgba = util::frame::Video::empty();
        scaler.run(frame, &mut rgba).map_err(map_error)?;

        // 去掉行对齐填充
        let stride = rgba.stride(0);
        let row = width as usize * 4;
        let source = rgba.data(0);
        let mut data = Vec::with_capacity(row * height as usize);
        for y in 0..height as usize {
            let start = y * stride;
            data.extend_from_slice(&source[start..start + row]);
        }

        Ok(VideoFrame {
            pts: frame.timestamp().or(frame.pts()).map(|pts| self.time_base.to_time(pts)),
            duration: self.frame_duration,
            width,
            height,
            format: PixelFormat::RGBA,
            data,
        })
    }
}

impl Decoder for FfmpegVideoDecoder {
    fn send_packet(&mut self, packet: &Packet) -> Result<(), CodecError> {
        send(&mut self.decoder, packet, &mut self.draining)
    }

    fn receive_frame(&mut self) -> Result<DecodedFrame, CodecError> {
        let mut frame = util::frame::Video::empty();
        self.decoder.receive_frame(&mut frame).map_err(map_error)?;
        self.convert(&frame).map(DecodedFrame::Video)
    }

    fn flush(&mut self) {
        self.decoder.flush();
        self.draining = false;
    }
}

/// 音频解码器：输出统一重采样为交错 f32
struct FfmpegAudioDecoder {
    decoder: codec::decoder::Audio,
    resampler: Option<software::resampling::Context>,
    time_base: Rational,
    target_channels: u16,
    draining: bool,
}

// SwrContext 只在持有解码器的线程中使用
unsafe impl Send for FfmpegAudioDecoder {}

impl FfmpegAudioDecoder {
    fn convert(&mut self, frame: &util::frame::Audio) -> Result<AudioFrame, CodecError> {
        let rate = frame.rate();
        let layout = if frame.channel_layout().is_empty() {
            util::channel_layout::ChannelLayout::default(frame.channels() as i32)
        } else {
            frame.channel_layout()
        };
        let target_layout = match self.target_channels {
            1 => util::channel_layout::ChannelLayout::MONO,
            _ => util::channel_layout::ChannelLayout::STEREO,
        };
        let rebuild = match &self.resampler {
            Some(resampler) => {
                resampler.input().rate != rate
                    || resampler.input().format != frame.format()
                    || resampler.input().channel_layout != layout
            }
            None => true,
        };
        if rebuild {
            debug!(
                "{} 🔧 初始化音频重采样器: {}Hz/{}ch → f32/{}ch",
                log_ctx(),
                rate,
                frame.channels(),
                self.target_channels
            );
            self.resampler = Some(
                software::resampling::Context::get(
                    frame.format(),
                    layout,
                    rate,
                    util::format::Sample::F32(util::format::sample::Type::Packed),
                    target_layout,
                    rate,
                )
                .map_err(map_error)?,
            );
        }
        let resampler = self
            .resampler
            .as_mut()
            .ok_or_else(|| CodecError::Fatal("重采样器未初始化".to_string()))?;

        let mut resampled = util::frame::Audio::empty();
        resampler.run(frame, &mut resampled).map_err(map_error)?;

        let samples = resampled.samples();
        let count = samples * self.target_channels as usize;
        let bytes = resampled.data(0);
        if bytes.len() < count * 4 {
            warn!("{} ⚠️ 重采样输出长度异常: {} < {}", log_ctx(), bytes.len(), count * 4);
            return Err(CodecError::InvalidData);
        }
        let data = bytes[..count * 4]
            .chunks_exact(4)
            .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .collect::<Vec<_>>();

        Ok(AudioFrame {
            pts: frame.timestamp().or(frame.pts()).map(|pts| self.time_base.to_time(pts)),
            duration: if rate > 0 { frame.samples() as Time * 1000 / rate as Time } else { 0 },
            sample_rate: rate,
            channels: self.target_channels,
            format: SampleFormat::F32,
            data,
        })
    }
}

impl Decoder for FfmpegAudioDecoder {
    fn send_packet(&mut self, packet: &Packet) -> Result<(), CodecError> {
        send(&mut self.decoder, packet, &mut self.draining)
    }

    fn receive_frame(&mut self) -> Result<DecodedFrame, CodecError> {
        let mut frame = util::frame::Audio::empty();
        self.decoder.receive_frame(&mut frame).map_err(map_error)?;
        self.convert(&frame).map(DecodedFrame::Audio)
    }

    fn flush(&mut self) {
        self.decoder.flush();
        self.draining = false;
    }
}
