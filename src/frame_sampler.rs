use ffmpeg_next as ffmpeg;
use ffmpeg::format::Pixel;
use ffmpeg::software::scaling::{self, Flags};
use image::RgbImage;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::error::SamplerError;

/// 容器未报告帧率时使用的默认帧率
pub const DEFAULT_FPS: f64 = 30.0;

/// 输出帧的目标分辨率（不保持宽高比）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            width: 640,
            height: 360,
        }
    }
}

/// 帧采样配置
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingConfig {
    /// 采样间隔（秒）
    pub interval_secs: f64,
    /// 输出分辨率
    pub resolution: Resolution,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5.0,
            resolution: Resolution::default(),
        }
    }
}

/// 用户上传的视频：原始字节 + 声明的文件名，只在一次分析请求内存在
#[derive(Debug, Clone)]
pub struct VideoAsset {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl VideoAsset {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            bytes,
        }
    }

    /// 小写的文件扩展名
    pub fn extension(&self) -> Option<String> {
        Path::new(&self.filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
    }
}

/// 采样得到的一帧
#[derive(Debug, Clone)]
pub struct SampledFrame {
    /// 源视频中的帧序号（从 0 开始）
    pub index: u64,
    /// 按帧率换算的时间点（秒）
    pub timestamp_secs: f64,
    pub image: RgbImage,
}

/// 按固定步长挑选帧：帧序号 % (fps * interval) == 0 时选中
#[derive(Debug, Clone)]
pub struct FrameSelector {
    fps: f64,
    stride: u64,
    next_index: u64,
}

impl FrameSelector {
    pub fn new(fps: Option<f64>, interval_secs: f64) -> Self {
        let fps = fps
            .filter(|f| f.is_finite() && *f > 0.0)
            .unwrap_or(DEFAULT_FPS);
        // NaN、0、负数都退化为逐帧采样
        let stride = (fps * interval_secs).round().max(1.0) as u64;
        Self {
            fps,
            stride,
            next_index: 0,
        }
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn stride(&self) -> u64 {
        self.stride
    }

    /// 记录一帧已解码，若该帧应被采样则返回其序号
    pub fn tick(&mut self) -> Option<u64> {
        let index = self.next_index;
        self.next_index += 1;
        (index % self.stride == 0).then_some(index)
    }

    pub fn timestamp_of(&self, index: u64) -> f64 {
        index as f64 / self.fps
    }

    /// 已经过的帧数
    pub fn frames_seen(&self) -> u64 {
        self.next_index
    }
}

/// 解码后的帧经过这里：挑帧、转 RGB24、缩放到目标分辨率
struct FramePipeline {
    selector: FrameSelector,
    target: Resolution,
    scaler: Option<((Pixel, u32, u32), scaling::Context)>,
    frames: Vec<SampledFrame>,
}

impl FramePipeline {
    fn new(selector: FrameSelector, target: Resolution) -> Self {
        Self {
            selector,
            target,
            scaler: None,
            frames: Vec::new(),
        }
    }

    fn drain(&mut self, decoder: &mut ffmpeg::decoder::Video) -> Result<(), SamplerError> {
        let mut decoded = ffmpeg::frame::Video::empty();
        while decoder.receive_frame(&mut decoded).is_ok() {
            self.push(&decoded)?;
        }
        Ok(())
    }

    fn push(&mut self, decoded: &ffmpeg::frame::Video) -> Result<(), SamplerError> {
        let Some(index) = self.selector.tick() else {
            return Ok(());
        };

        let scaler = self.scaler_for(decoded)?;
        let mut rgb_frame = ffmpeg::frame::Video::empty();
        if let Err(e) = scaler.run(decoded, &mut rgb_frame) {
            warn!("⚠️  [帧采样] 第 {} 帧转换失败，跳过: {}", index, e);
            return Ok(());
        }

        let image = frame_to_image(&rgb_frame)?;
        let timestamp_secs = self.selector.timestamp_of(index);
        debug!("📸 [帧采样] 选中第 {} 帧 ({:.2}s)", index, timestamp_secs);
        self.frames.push(SampledFrame {
            index,
            timestamp_secs,
            image,
        });
        Ok(())
    }

    /// 源帧格式或尺寸变化时重建缩放器
    fn scaler_for(
        &mut self,
        decoded: &ffmpeg::frame::Video,
    ) -> Result<&mut scaling::Context, SamplerError> {
        let key = (decoded.format(), decoded.width(), decoded.height());
        let context = match self.scaler.take() {
            Some((current, context)) if current == key => context,
            _ => scaling::Context::get(
                key.0,
                key.1,
                key.2,
                Pixel::RGB24,
                self.target.width,
                self.target.height,
                Flags::BILINEAR,
            )
            .map_err(SamplerError::Scaler)?,
        };
        let (_, context) = self.scaler.insert((key, context));
        Ok(context)
    }

    fn into_frames(self) -> Vec<SampledFrame> {
        self.frames
    }
}

/// 帧采样器，负责从本地视频文件中按固定时间间隔抽帧
pub struct FrameSampler {
    input_path: PathBuf,
}

impl FrameSampler {
    pub fn new(input_path: impl AsRef<Path>) -> Result<Self, SamplerError> {
        ffmpeg::init().map_err(SamplerError::Init)?;
        // 只输出错误级别的 FFmpeg 日志
        ffmpeg::util::log::set_level(ffmpeg::util::log::Level::Error);

        Ok(Self {
            input_path: input_path.as_ref().to_path_buf(),
        })
    }

    /// 顺序解码全部帧，按采样间隔挑帧
    ///
    /// 没有可解码的帧时返回空序列而不是错误。
    pub fn sample(&self, config: &SamplingConfig) -> Result<Vec<SampledFrame>, SamplerError> {
        let start = Instant::now();
        let mut ictx = ffmpeg::format::input(&self.input_path).map_err(SamplerError::Open)?;

        let (stream_index, fps, parameters) = {
            let stream = ictx
                .streams()
                .best(ffmpeg::media::Type::Video)
                .ok_or(SamplerError::NoVideoStream)?;
            let fps = frame_rate(stream.avg_frame_rate()).or_else(|| frame_rate(stream.rate()));
            (stream.index(), fps, stream.parameters())
        };

        let mut decoder = ffmpeg::codec::context::Context::from_parameters(parameters)
            .and_then(|context| context.decoder().video())
            .map_err(SamplerError::Decoder)?;

        if fps.is_none() {
            warn!("⚠️  [帧采样] 容器未报告帧率，按 {:.0} fps 计算", DEFAULT_FPS);
        }
        let selector = FrameSelector::new(fps, config.interval_secs);
        info!(
            "🎬 [帧采样] 开始采样: {} ({}x{}, {:.2} fps, 每 {} 帧取 1 帧)",
            self.input_path.display(),
            decoder.width(),
            decoder.height(),
            selector.fps(),
            selector.stride()
        );

        let mut pipeline = FramePipeline::new(selector, config.resolution);
        for (stream, packet) in ictx.packets() {
            if stream.index() != stream_index {
                continue;
            }
            if let Err(e) = decoder.send_packet(&packet) {
                debug!("[帧采样] 跳过无法解码的数据包: {}", e);
                continue;
            }
            pipeline.drain(&mut decoder)?;
        }
        if decoder.send_eof().is_ok() {
            pipeline.drain(&mut decoder)?;
        }

        let decoded = pipeline.selector.frames_seen();
        let frames = pipeline.into_frames();
        info!(
            "✅ [帧采样] 完成: 解码 {} 帧，采样 {} 帧，耗时 {:.2}秒",
            decoded,
            frames.len(),
            start.elapsed().as_secs_f64()
        );
        Ok(frames)
    }
}

fn frame_rate(rate: ffmpeg::Rational) -> Option<f64> {
    (rate.numerator() > 0 && rate.denominator() > 0)
        .then(|| rate.numerator() as f64 / rate.denominator() as f64)
}

/// 将 RGB24 的 FFmpeg 帧转换为 RgbImage（去掉行尾填充）
fn frame_to_image(frame: &ffmpeg::frame::Video) -> Result<RgbImage, SamplerError> {
    let width = frame.width();
    let height = frame.height();
    let row_len = width as usize * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    let mut buf = Vec::with_capacity(row_len * height as usize);
    for row in data.chunks(stride.max(1)).take(height as usize) {
        let pixels = row
            .get(..row_len)
            .ok_or(SamplerError::FrameBuffer { width, height })?;
        buf.extend_from_slice(pixels);
    }

    RgbImage::from_raw(width, height, buf).ok_or(SamplerError::FrameBuffer { width, height })
}

/// 临时文件后缀：只保留上传文件名的扩展名，避免路径穿越和同名冲突
fn scratch_suffix(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| format!(".{}", e))
        .unwrap_or_default()
}

/// 把上传的视频写入临时目录后抽帧，临时文件在所有返回路径上都会被删除
pub fn sample_upload(
    asset: VideoAsset,
    scratch_dir: &Path,
    config: &SamplingConfig,
) -> Result<Vec<SampledFrame>, SamplerError> {
    std::fs::create_dir_all(scratch_dir)?;

    let VideoAsset { filename, bytes } = asset;
    let mut scratch = tempfile::Builder::new()
        .prefix("upload-")
        .suffix(&scratch_suffix(&filename))
        .tempfile_in(scratch_dir)?;
    scratch.write_all(&bytes)?;
    scratch.flush()?;
    drop(bytes);

    info!(
        "⏳ [帧采样] 已暂存上传视频 {} -> {}",
        filename,
        scratch.path().display()
    );

    let sampler = FrameSampler::new(scratch.path())?;
    sampler.sample(config)
}

/// 在阻塞线程池上执行 [`sample_upload`]
pub async fn sample_upload_blocking(
    asset: VideoAsset,
    scratch_dir: PathBuf,
    config: SamplingConfig,
) -> Result<Vec<SampledFrame>, SamplerError> {
    tokio::task::spawn_blocking(move || sample_upload(asset, &scratch_dir, &config))
        .await
        .map_err(|e| SamplerError::Worker(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_frame(format: Pixel, width: u32, height: u32, bytes: [u8; 3]) -> ffmpeg::frame::Video {
        let mut frame = ffmpeg::frame::Video::new(format, width, height);
        let stride = frame.stride(0);
        let data = frame.data_mut(0);
        for y in 0..height as usize {
            for x in 0..width as usize {
                let idx = y * stride + x * 3;
                data[idx..idx + 3].copy_from_slice(&bytes);
            }
        }
        frame
    }

    /// 用 MPEG-4 编码器写一段纯色视频，每 `shade_every` 帧亮度提升一级
    fn write_clip(
        path: &Path,
        (width, height): (u32, u32),
        fps: i32,
        frame_count: i64,
        shade_every: i64,
    ) -> Result<(), ffmpeg::Error> {
        ffmpeg::init()?;
        let mut octx = ffmpeg::format::output(&path)?;
        let codec = ffmpeg::encoder::find(ffmpeg::codec::Id::MPEG4)
            .ok_or(ffmpeg::Error::EncoderNotFound)?;
        let global_header = octx
            .format()
            .flags()
            .contains(ffmpeg::format::Flags::GLOBAL_HEADER);
        let frame_time_base = ffmpeg::Rational::new(1, fps);

        let mut encoder = ffmpeg::codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()?;
        encoder.set_width(width);
        encoder.set_height(height);
        encoder.set_format(Pixel::YUV420P);
        encoder.set_time_base(frame_time_base);
        encoder.set_frame_rate(Some(ffmpeg::Rational::new(fps, 1)));
        if global_header {
            encoder.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
        }
        let mut encoder = encoder.open_as(codec)?;
        {
            let mut stream = octx.add_stream(codec)?;
            stream.set_time_base(frame_time_base);
            stream.set_parameters(&encoder);
        }
        octx.write_header()?;
        let stream_time_base = octx
            .stream(0)
            .map(|s| s.time_base())
            .ok_or(ffmpeg::Error::StreamNotFound)?;

        let write_packets = |encoder: &mut ffmpeg::encoder::Video,
                                 octx: &mut ffmpeg::format::context::Output|
         -> Result<(), ffmpeg::Error> {
            let mut packet = ffmpeg::Packet::empty();
            while encoder.receive_packet(&mut packet).is_ok() {
                packet.set_stream(0);
                packet.rescale_ts(frame_time_base, stream_time_base);
                packet.write_interleaved(octx)?;
            }
            Ok(())
        };

        for i in 0..frame_count {
            let luma = 16 + (i / shade_every * 30).min(219) as u8;
            let mut frame = ffmpeg::frame::Video::new(Pixel::YUV420P, width, height);
            for (plane, value) in [(0, luma), (1, 128), (2, 128)] {
                frame.data_mut(plane).fill(value);
            }
            frame.set_pts(Some(i));
            encoder.send_frame(&frame)?;
            write_packets(&mut encoder, &mut octx)?;
        }
        encoder.send_eof()?;
        write_packets(&mut encoder, &mut octx)?;
        octx.write_trailer()
    }

    fn close(a: u8, b: u8) -> bool {
        (a as i16 - b as i16).abs() <= 2
    }

    #[test]
    fn stride_follows_fps_and_interval() {
        assert_eq!(FrameSelector::new(Some(30.0), 5.0).stride(), 150);
        assert_eq!(FrameSelector::new(Some(29.97), 5.0).stride(), 150);
        assert_eq!(FrameSelector::new(Some(25.0), 2.0).stride(), 50);
        assert_eq!(FrameSelector::new(Some(24.0), 0.01).stride(), 1);
    }

    #[test]
    fn missing_fps_falls_back_to_default() {
        for fps in [None, Some(0.0), Some(-1.0), Some(f64::NAN), Some(f64::INFINITY)] {
            let selector = FrameSelector::new(fps, 5.0);
            assert_eq!(selector.fps(), DEFAULT_FPS);
            assert_eq!(selector.stride(), 150);
        }
    }

    #[test]
    fn selected_count_is_ceil_of_duration_over_interval() {
        for (fps, duration, interval) in [(30u64, 30u64, 5u64), (30, 31, 5), (25, 10, 3), (24, 7, 1), (60, 4, 10)] {
            let mut selector = FrameSelector::new(Some(fps as f64), interval as f64);
            let selected = (0..fps * duration).filter(|_| selector.tick().is_some()).count() as u64;
            assert_eq!(selected, duration.div_ceil(interval), "fps={} d={} k={}", fps, duration, interval);
        }
    }

    #[test]
    fn zero_frames_select_nothing() {
        let pipeline = FramePipeline::new(FrameSelector::new(Some(30.0), 5.0), Resolution::default());
        assert!(pipeline.into_frames().is_empty());
    }

    #[test]
    fn frame_to_image_drops_row_padding() {
        let mut frame = ffmpeg::frame::Video::new(Pixel::RGB24, 5, 3);
        let stride = frame.stride(0);
        let data = frame.data_mut(0);
        for y in 0..3usize {
            for x in 0..5usize {
                let idx = y * stride + x * 3;
                data[idx] = x as u8;
                data[idx + 1] = y as u8;
                data[idx + 2] = 200;
            }
        }

        let image = frame_to_image(&frame).unwrap();
        assert_eq!(image.dimensions(), (5, 3));
        assert_eq!(image.get_pixel(4, 2).0, [4, 2, 200]);
        assert_eq!(image.get_pixel(0, 1).0, [0, 1, 200]);
    }

    #[test]
    fn thirty_second_clip_yields_six_rgb_frames_in_order() {
        // 30 秒 30fps，每帧灰度值编码帧序号
        let mut pipeline =
            FramePipeline::new(FrameSelector::new(Some(30.0), 5.0), Resolution::default());
        for i in 0..900u32 {
            let shade = (i / 150 * 40) as u8;
            let frame = solid_frame(Pixel::RGB24, 64, 36, [shade, shade, shade]);
            pipeline.push(&frame).unwrap();
        }

        let frames = pipeline.into_frames();
        assert_eq!(frames.len(), 6);
        let indices: Vec<u64> = frames.iter().map(|f| f.index).collect();
        assert_eq!(indices, vec![0, 150, 300, 450, 600, 750]);
        for (n, frame) in frames.iter().enumerate() {
            assert_eq!(frame.image.dimensions(), (640, 360));
            assert!((frame.timestamp_secs - n as f64 * 5.0).abs() < 1e-9);
            let px = frame.image.get_pixel(320, 180).0;
            assert!(close(px[0], (n * 40) as u8), "frame {} shade {:?}", n, px);
        }
    }

    #[test]
    fn bgr_source_is_converted_to_rgb() {
        let mut pipeline = FramePipeline::new(
            FrameSelector::new(Some(30.0), 5.0),
            Resolution { width: 32, height: 18 },
        );
        // BGR 字节序里的纯红
        let frame = solid_frame(Pixel::BGR24, 100, 50, [0, 0, 255]);
        pipeline.push(&frame).unwrap();

        let frames = pipeline.into_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].image.dimensions(), (32, 18));
        let px = frames[0].image.get_pixel(16, 9).0;
        assert!(close(px[0], 255) && close(px[1], 0) && close(px[2], 0), "{:?}", px);
    }

    #[test]
    fn scratch_suffix_keeps_only_extension() {
        assert_eq!(scratch_suffix("clip.MP4"), ".MP4");
        assert_eq!(scratch_suffix("../../etc/passwd.mov"), ".mov");
        assert_eq!(scratch_suffix("no-extension"), "");
        assert_eq!(scratch_suffix("weird.m p4"), "");
    }

    #[test]
    fn undecodable_upload_fails_and_cleans_scratch() {
        let scratch = tempfile::tempdir().unwrap();
        let asset = VideoAsset::new("broken.mp4", b"definitely not a video".to_vec());

        let result = sample_upload(asset, scratch.path(), &SamplingConfig::default());

        assert!(result.is_err());
        let leftovers: Vec<_> = std::fs::read_dir(scratch.path()).unwrap().collect();
        assert!(leftovers.is_empty(), "临时文件未清理: {:?}", leftovers);
    }

    #[test]
    fn encoded_clip_is_sampled_end_to_end() {
        let source = tempfile::tempdir().unwrap();
        let clip = source.path().join("clip.mp4");
        // 30 秒 30fps，每 5 秒换一次亮度
        write_clip(&clip, (320, 180), 30, 900, 150).unwrap();
        let bytes = std::fs::read(&clip).unwrap();

        let scratch = tempfile::tempdir().unwrap();
        let frames = sample_upload(
            VideoAsset::new("clip.mp4", bytes),
            scratch.path(),
            &SamplingConfig::default(),
        )
        .unwrap();

        assert_eq!(frames.len(), 6);
        let indices: Vec<u64> = frames.iter().map(|f| f.index).collect();
        assert_eq!(indices, vec![0, 150, 300, 450, 600, 750]);
        for frame in &frames {
            assert_eq!(frame.image.dimensions(), (640, 360));
        }
        let shades: Vec<u8> = frames
            .iter()
            .map(|f| f.image.get_pixel(320, 180).0[0])
            .collect();
        assert!(shades.windows(2).all(|w| w[0] < w[1]), "亮度未按时间递增: {:?}", shades);

        let leftovers: Vec<_> = std::fs::read_dir(scratch.path()).unwrap().collect();
        assert!(leftovers.is_empty(), "临时文件未清理: {:?}", leftovers);
    }

    #[test]
    fn asset_extension_is_lowercased() {
        assert_eq!(VideoAsset::new("Trip.MOV", vec![]).extension().as_deref(), Some("mov"));
        assert_eq!(VideoAsset::new("trip", vec![]).extension(), None);
    }
}
