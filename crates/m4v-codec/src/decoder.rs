//! 多层解码器.
//!
//! 每个解码层 (基本层与可选的增强层) 独立持有头部解析器、帧解码器和参考帧.
//! 调用方以 [`LayerIndex`] 指定层, 每次送入一个访问单元 (一帧的码流)
//! 并提供该层的熵解码器.

use log::{debug, warn};
use m4v_core::{BitCursor, M4vError, M4vResult, Status};

use crate::entropy::SymbolDecoder;
use crate::frame::{FrameCoefficients, FrameDecoder, FrameReport};
use crate::header::{HeaderParser, LayerConfig, PictureType};
use crate::options::DecoderOptions;
use crate::picture::Picture;

/// 解码层下标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayerIndex(pub usize);

/// 单个解码层的状态
#[derive(Debug)]
struct LayerState {
    parser: HeaderParser,
    frames: FrameDecoder,
    /// 最近的 I/P 帧
    reference: Option<Picture>,
    /// 最近的 B 帧, 不作为参考
    bidirectional: Option<Picture>,
    /// 回收的图像缓冲区
    spare: Option<Picture>,
    /// 最近一帧是否为 B 帧
    last_was_b: bool,
    frame_count: u64,
}

impl LayerState {
    fn new(options: DecoderOptions) -> Self {
        Self {
            parser: HeaderParser::new(options),
            frames: FrameDecoder::new(),
            reference: None,
            bidirectional: None,
            spare: None,
            last_was_b: false,
            frame_count: 0,
        }
    }

    /// 取一个与层尺寸一致的图像缓冲区
    fn take_picture(&mut self, layer: &LayerConfig) -> Picture {
        match self.spare.take() {
            Some(picture) if picture.width() == layer.width && picture.height() == layer.height => {
                picture
            }
            _ => Picture::new(layer.width, layer.height),
        }
    }
}

/// 解码器
#[derive(Debug)]
pub struct Decoder {
    options: DecoderOptions,
    layers: Vec<LayerState>,
}

impl Decoder {
    /// 创建只含基本层的解码器
    pub fn new(options: DecoderOptions) -> Self {
        Self {
            layers: vec![LayerState::new(options.clone())],
            options,
        }
    }

    pub fn options(&self) -> &DecoderOptions {
        &self.options
    }

    /// 基本层
    pub fn base_layer(&self) -> LayerIndex {
        LayerIndex(0)
    }

    /// 新增一个增强层
    pub fn add_layer(&mut self) -> LayerIndex {
        self.layers.push(LayerState::new(self.options.clone()));
        let index = LayerIndex(self.layers.len() - 1);
        debug!("新增解码层 {}", index.0);
        index
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    fn state(&self, layer: LayerIndex) -> M4vResult<&LayerState> {
        self.layers
            .get(layer.0)
            .ok_or_else(|| M4vError::InvalidArgument(format!("解码层 {} 不存在", layer.0)))
    }

    fn state_mut(&mut self, layer: LayerIndex) -> M4vResult<&mut LayerState> {
        self.layers
            .get_mut(layer.0)
            .ok_or_else(|| M4vError::InvalidArgument(format!("解码层 {} 不存在", layer.0)))
    }

    /// 层的头部解析器
    pub fn parser(&self, layer: LayerIndex) -> M4vResult<&HeaderParser> {
        Ok(&self.state(layer)?.parser)
    }

    /// 层的帧解码器 (宏块上下文与系数)
    pub fn frame_decoder(&self, layer: LayerIndex) -> M4vResult<&FrameDecoder> {
        Ok(&self.state(layer)?.frames)
    }

    /// 层最近一帧的系数输出
    pub fn coefficients(&self, layer: LayerIndex) -> M4vResult<FrameCoefficients<'_>> {
        Ok(self.state(layer)?.frames.output())
    }

    /// 层最近解码的图像
    pub fn picture(&self, layer: LayerIndex) -> Option<&Picture> {
        let state = self.layers.get(layer.0)?;
        if state.last_was_b {
            state.bidirectional.as_ref()
        } else {
            state.reference.as_ref()
        }
    }

    /// 层已解码的帧数
    pub fn frame_count(&self, layer: LayerIndex) -> u64 {
        self.layers.get(layer.0).map_or(0, |state| state.frame_count)
    }

    /// 解析层配置 (解码器配置记录或码流开头)
    ///
    /// 可恢复的头部问题返回 `RecoverableHeaderIssue`, 配置照常生效.
    pub fn configure(&mut self, layer: LayerIndex, data: &[u8]) -> M4vResult<Status> {
        let state = self.state_mut(layer)?;
        let mut cursor = BitCursor::new(data);
        configure_layer(&mut state.parser, &mut cursor, layer)
    }

    /// 解码一个访问单元
    ///
    /// 层尚未配置时先从数据开头解析层配置. I/P 帧解码后成为该层的参考帧,
    /// B 帧不替换参考帧.
    pub fn decode_access_unit<D: SymbolDecoder + ?Sized>(
        &mut self,
        layer: LayerIndex,
        data: &[u8],
        symbols: &mut D,
    ) -> M4vResult<FrameReport> {
        let state = self.state_mut(layer)?;
        let mut cursor = BitCursor::new(data);
        if state.parser.layer().is_none() {
            configure_layer(&mut state.parser, &mut cursor, layer)?;
        }
        let frame = state.parser.parse_frame(&mut cursor)?;
        let Some(config) = state.parser.layer().cloned() else {
            return Err(M4vError::InvalidArgument("尚未解析层配置".into()));
        };

        let mut current = state.take_picture(&config);
        let report = state.frames.decode(
            &mut state.parser,
            &mut cursor,
            symbols,
            &mut current,
            state.reference.as_ref(),
        )?;
        state.frame_count += 1;

        if frame.picture_type == PictureType::B {
            state.spare = state.bidirectional.replace(current);
            state.last_was_b = true;
        } else {
            state.spare = state.reference.replace(current);
            state.last_was_b = false;
        }
        debug!(
            "层 {} 第 {} 帧: {:?}, {:?}",
            layer.0, state.frame_count, report.picture_type, report.status
        );
        Ok(report)
    }

    /// 丢弃所有层的参考帧, 层配置保留
    pub fn flush(&mut self) {
        for state in &mut self.layers {
            state.reference = None;
            state.bidirectional = None;
            state.last_was_b = false;
        }
        debug!("解码器已刷新, 清空参考帧");
    }
}

fn configure_layer(
    parser: &mut HeaderParser,
    cursor: &mut BitCursor,
    layer: LayerIndex,
) -> M4vResult<Status> {
    match parser.parse_configuration(cursor, layer.0) {
        Ok(_) => Ok(Status::Success),
        Err(M4vError::RecoverableHeader(detail)) => {
            warn!("层 {} 配置存在可恢复问题: {}", layer.0, detail);
            Ok(Status::RecoverableHeaderIssue)
        }
        Err(err) => Err(err),
    }
}
