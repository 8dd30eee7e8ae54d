use anyhow::{anyhow, bail, Context, Result};
use log::{info, warn};
use myy_streaming::core::{
    FrameRequest, Mode, MonotonicTime, PlaybackOptions, StreamingConfig, Time, TimeSource, Update,
    VideoFrame,
};
use myy_streaming::player::{CpalAudioSink, FfmpegBackend, FileLoader, Player, PlayerCaps};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// 命令行参数
struct Args {
    path: String,
    config: Option<String>,
    options: PlaybackOptions,
}

fn parse_args() -> Result<Args> {
    let mut args = std::env::args().skip(1);
    let mut path = None;
    let mut config = None;
    let mut options = PlaybackOptions::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--position" => options.position = next_value(&mut args, &arg)?.parse().context("--position 需要毫秒数")?,
            "--speed" => options.speed = next_value(&mut args, &arg)?.parse().context("--speed 需要数字")?,
            "--mode" => {
                let value = next_value(&mut args, &arg)?;
                options.mode = serde_json::from_value::<Mode>(serde_json::Value::String(value))
                    .context("--mode 只支持 audio / video / both / inspection")?;
            }
            "--loop" => options.looping = true,
            "--config" => config = Some(next_value(&mut args, &arg)?),
            _ if arg.starts_with("--") => bail!("未知参数: {}", arg),
            _ => path = Some(arg),
        }
    }
    let path = path.ok_or_else(|| {
        anyhow!("用法: myy_streaming <文件> [--position ms] [--speed x] [--mode both] [--loop] [--config 配置.json]")
    })?;
    Ok(Args { path, config, options })
}

/// 按显示时间统计已上屏的帧，同一时间点只计一次
#[derive(Default)]
struct FrameCounter {
    count: u64,
    last_shown_at: Option<Time>,
}

impl FrameCounter {
    fn present(&mut self, at: Time, frame: &VideoFrame) {
        if self.last_shown_at == Some(at) {
            return;
        }
        self.last_shown_at = Some(at);
        self.count += 1;
        log::trace!("🖼️ 显示帧 pts={:?} @ {} ms", frame.pts, at);
    }
}

fn next_value(args: &mut impl Iterator<Item = String>, name: &str) -> Result<String> {
    args.next().ok_or_else(|| anyhow!("{} 缺少参数值", name))
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("🎬 myy_streaming 启动");
    let args = parse_args()?;

    let config = match &args.config {
        Some(path) => StreamingConfig::from_json_file(path).with_context(|| format!("读取配置失败: {}", path))?,
        None => StreamingConfig::default(),
    };
    let time: Arc<dyn TimeSource> = Arc::new(MonotonicTime::new());
    let backend = FfmpegBackend::new().map_err(|e| anyhow!("FFmpeg 初始化失败: {}", e))?;
    let audio_sink = CpalAudioSink::new(time.clone())?;
    let loader = FileLoader::open(&args.path).with_context(|| format!("无法打开文件: {}", args.path))?;

    let caps = PlayerCaps {
        backend: Arc::new(backend),
        audio_sink: Arc::new(audio_sink),
        time: time.clone(),
        config,
    };
    let mut player = Player::new(Arc::new(loader), None, caps);
    let updates = player.updates();
    let errors = player.errors();
    player.play(args.options)?;

    let mut shown_frames = FrameCounter::default();
    let mut last_report: Time = 0;
    loop {
        player.update();

        while let Ok(update) = updates.try_recv() {
            match update {
                Update::Information(information) => {
                    info!(
                        "📋 媒体信息: 视频 {:?} {}x{}, 音频 {:?}, 头部 {} bytes",
                        information.video.state.duration,
                        information.video.size.0,
                        information.video.size.1,
                        information.audio.state.duration,
                        information.header_size
                    );
                }
                Update::WaitingForData(waiting) => {
                    if waiting {
                        warn!("⏳ 等待数据...");
                    } else {
                        info!("▶️ 数据已足够，继续播放");
                    }
                }
                Update::Finished => info!("🏁 播放结束（共显示 {} 帧）", shown_frames.count),
                _ => {}
            }
        }
        if let Ok(error) = errors.try_recv() {
            bail!("播放失败: {}", error);
        }
        if player.finished() || !player.active() {
            break;
        }

        if let Some(at) = player.next_frame_time() {
            if at <= time.now() {
                if let Some(frame) = player.frame(&FrameRequest::default()) {
                    shown_frames.present(at, &frame);
                    player.mark_frame_shown();
                }
            }
        }

        let now = time.now();
        if now - last_report >= 1000 {
            last_report = now;
            let state = player.legacy_state();
            info!(
                "⏱️ {:?} {} / {} ms（已接收 {:?}）",
                state.state, state.position, state.length, state.received_till
            );
        }
        thread::sleep(Duration::from_millis(5));
    }

    player.stop();
    info!("👋 退出");
    Ok(())
}
