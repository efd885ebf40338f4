//! 帧解码循环.
//!
//! 按光栅顺序遍历宏块, 在宏块边界检查同步标记. 宏块头与系数符号由外部
//! [`SymbolDecoder`] 提供, 系数经 [`CoefficientReconstructor`] 重建后保存在
//! 每宏块 6 个块的系数缓冲区中, 供外部 IDCT 使用. 跳过的宏块与被隐藏的宏块
//! 直接写入像素 (参考帧复制或中性灰).
//!
//! 数据分区模式下, 每个 video packet 依次解码分区 A (宏块头, I 帧含 DC),
//! 分区 B (cbpy/ac_pred, P 帧含 DC) 与分区 C (纹理).

use log::{debug, trace};
use m4v_core::{BitCursor, M4vError, M4vResult, Status};

use crate::conceal::ConcealmentController;
use crate::context::{MacroblockContext, MacroblockInfo, MacroblockMode};
use crate::entropy::{MacroblockHeader, SymbolDecoder};
use crate::header::{FrameHeader, HeaderParser, LayerConfig, PictureType, ResyncHeader};
use crate::marker::{
    self, DC_MARKER, DC_MARKER_LEN, MOTION_MARKER, MOTION_MARKER_LEN, ResyncPoint,
};
use crate::picture::{NEUTRAL_GREY, Picture};
use crate::reconstruct::{CoefficientReconstructor, DcSource, IntraBlock};

/// 一个宏块的 6 个反量化块 (光栅顺序)
pub type MacroblockCoefficients = [[i32; 64]; 6];

/// 短头模式的量化参数上限
const SHORT_HEADER_MAX_QP: u32 = 31;

/// 一帧的系数输出, 供外部 IDCT 与运动补偿使用
#[derive(Debug, Clone, Copy)]
pub struct FrameCoefficients<'a> {
    /// 每宏块 6 个反量化块
    pub blocks: &'a [MacroblockCoefficients],
    /// 每宏块的模式、量化参数与条带号
    pub macroblocks: &'a [MacroblockInfo],
}

/// 单帧解码结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameReport {
    /// `Success`: 所有宏块已处理; `EndOfUnit`: 数据在帧结束前耗尽, 剩余宏块已隐藏
    pub status: Status,
    pub picture_type: PictureType,
    pub coded: bool,
    /// 成功解码的宏块数 (含跳过宏块)
    pub decoded_mbs: usize,
    pub concealed_mbs: usize,
    /// 首个单元之后的同步单元数
    pub resync_units: u32,
    pub bits_consumed: usize,
}

/// 一帧内不变的参数
struct FrameScope<'a> {
    layer: &'a LayerConfig,
    frame: &'a FrameHeader,
    rec: CoefficientReconstructor,
    max_qp: u32,
    max_scan_bytes: Option<usize>,
    conceal_errors: bool,
}

impl FrameScope<'_> {
    fn apply_dquant(&self, qp: u32, dquant: i32) -> u32 {
        (i64::from(qp) + i64::from(dquant)).clamp(1, i64::from(self.max_qp)) as u32
    }
}

/// 遍历进度
#[derive(Debug, Default)]
struct Walk {
    mb: usize,
    slice: u32,
    qp: u32,
    units: u32,
    decoded: usize,
}

/// 当前帧与参考帧
struct Pictures<'p> {
    current: &'p mut Picture,
    reference: Option<&'p Picture>,
}

impl<'p> Pictures<'p> {
    /// 尺寸一致的参考帧
    fn usable_reference(&self) -> Option<&'p Picture> {
        let (width, height) = (self.current.width(), self.current.height());
        self.reference
            .filter(|r| r.width() == width && r.height() == height)
    }

    /// 宏块沿用参考帧内容, 无参考帧时填充中性灰
    fn repeat_macroblock(&mut self, mb_x: usize, mb_y: usize) -> M4vResult<()> {
        match self.usable_reference() {
            Some(reference) => self.current.copy_macroblock_from(reference, mb_x, mb_y),
            None => self.current.fill_macroblock(mb_x, mb_y, NEUTRAL_GREY),
        }
    }
}

/// 错误恢复的结果
enum Recovery {
    /// 已在新的同步单元处恢复
    Resume,
    /// 本帧结束
    Finished(Status),
}

/// 分区 A/B 中收集的宏块
struct PartitionEntry {
    header: MacroblockHeader,
    qp: u32,
    dc: Option<[i32; 6]>,
}

/// 帧解码器, 每个解码层一个实例
#[derive(Debug, Clone, Default)]
pub struct FrameDecoder {
    ctx: MacroblockContext,
    conceal: ConcealmentController,
    blocks: Vec<MacroblockCoefficients>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前帧的宏块上下文
    pub fn context(&self) -> &MacroblockContext {
        &self.ctx
    }

    /// 当前帧所有宏块的反量化系数
    pub fn coefficients(&self) -> &[MacroblockCoefficients] {
        &self.blocks
    }

    /// 系数与宏块元数据
    pub fn output(&self) -> FrameCoefficients<'_> {
        FrameCoefficients {
            blocks: &self.blocks,
            macroblocks: self.ctx.infos(),
        }
    }

    /// 解码一帧
    ///
    /// `parser` 中须已有层配置与本帧的帧头, 游标位于帧头之后.
    /// `current` 的尺寸须与层配置一致. 宏块失败时按选项执行错误隐藏,
    /// 关闭隐藏时直接返回错误.
    pub fn decode<D: SymbolDecoder + ?Sized>(
        &mut self,
        parser: &mut HeaderParser,
        cursor: &mut BitCursor,
        symbols: &mut D,
        current: &mut Picture,
        reference: Option<&Picture>,
    ) -> M4vResult<FrameReport> {
        let (Some(layer), Some(frame)) = (parser.layer().cloned(), parser.frame().cloned()) else {
            return Err(M4vError::InvalidArgument("尚未解析层配置与帧头".into()));
        };
        if current.width() != layer.width || current.height() != layer.height {
            return Err(M4vError::InvalidArgument(format!(
                "输出图像 {}x{} 与层尺寸 {}x{} 不一致",
                current.width(),
                current.height(),
                layer.width,
                layer.height
            )));
        }

        let start = cursor.position();
        self.prepare(&layer);
        let mut pictures = Pictures { current, reference };
        let mut report = FrameReport {
            status: Status::Success,
            picture_type: frame.picture_type,
            coded: frame.coded,
            decoded_mbs: 0,
            concealed_mbs: 0,
            resync_units: 0,
            bits_consumed: 0,
        };

        if !frame.coded {
            // 未编码帧: 内容与参考帧相同
            for mb in 0..layer.total_mbs {
                pictures.repeat_macroblock(mb % layer.mb_cols, mb / layer.mb_cols)?;
                self.ctx.mark_skipped(mb, 0);
            }
            report.decoded_mbs = layer.total_mbs;
            report.bits_consumed = cursor.position() - start;
            debug!("未编码帧 {:?}, 沿用参考帧", frame.picture_type);
            return Ok(report);
        }

        let options = parser.options().clone();
        let scope = FrameScope {
            layer: &layer,
            frame: &frame,
            rec: CoefficientReconstructor::new(&layer, &frame),
            max_qp: if frame.short_header {
                SHORT_HEADER_MAX_QP
            } else {
                (1u32 << layer.quant_precision) - 1
            },
            max_scan_bytes: options.max_resync_scan_bytes,
            conceal_errors: options.conceal_errors,
        };
        let mut walk = Walk {
            qp: frame.quant,
            ..Walk::default()
        };

        let partitioned = layer.data_partitioned && !frame.short_header;
        report.status = if partitioned {
            self.decode_partitioned(parser, cursor, symbols, &scope, &mut walk, &mut pictures)?
        } else {
            self.decode_combined(parser, cursor, symbols, &scope, &mut walk, &mut pictures)?
        };
        report.decoded_mbs = walk.decoded;
        report.concealed_mbs = self.conceal.concealed_mbs();
        report.resync_units = walk.units;
        report.bits_consumed = cursor.position() - start;
        debug!(
            "{:?} 帧完成: 解码 {} / {} 宏块, 隐藏 {}, 同步单元 {}, {:?}",
            frame.picture_type,
            report.decoded_mbs,
            layer.total_mbs,
            report.concealed_mbs,
            report.resync_units,
            report.status
        );
        Ok(report)
    }

    fn prepare(&mut self, layer: &LayerConfig) {
        if self.ctx.mb_cols() != layer.mb_cols || self.ctx.mb_rows() != layer.mb_rows {
            self.ctx.resize(layer.mb_cols, layer.mb_rows);
        } else {
            self.ctx.reset();
        }
        self.blocks.clear();
        self.blocks.resize(layer.total_mbs, [[0; 64]; 6]);
        self.conceal.begin_frame();
    }

    /// 普通 (非分区) 模式
    fn decode_combined<D: SymbolDecoder + ?Sized>(
        &mut self,
        parser: &mut HeaderParser,
        cursor: &mut BitCursor,
        symbols: &mut D,
        scope: &FrameScope<'_>,
        walk: &mut Walk,
        pictures: &mut Pictures<'_>,
    ) -> M4vResult<Status> {
        let total = scope.layer.total_mbs;
        let resync_enabled = scope.frame.short_header || scope.layer.error_resilient();
        while walk.mb < total {
            let step = if walk.mb > 0 && resync_enabled && parser.check_resync_marker(cursor) {
                parser
                    .parse_resync_header(cursor)
                    .and_then(|header| self.enter_unit(&header, walk, pictures))
            } else if cursor.at_end() || at_start_code(cursor) {
                Err(M4vError::EndOfUnit)
            } else {
                self.decode_macroblock(cursor, symbols, scope, walk, pictures)
            };
            match step {
                Ok(()) => {}
                Err(M4vError::EndOfUnit) => {
                    self.conceal_rest(walk, pictures)?;
                    return Ok(Status::EndOfUnit);
                }
                Err(err) => {
                    if !scope.conceal_errors {
                        return Err(err);
                    }
                    debug!("宏块 {} 出错: {}", walk.mb, err);
                    if let Recovery::Finished(status) =
                        self.recover(parser, cursor, scope, walk, pictures)?
                    {
                        return Ok(status);
                    }
                }
            }
        }
        Ok(Status::Success)
    }

    fn decode_macroblock<D: SymbolDecoder + ?Sized>(
        &mut self,
        cursor: &mut BitCursor,
        symbols: &mut D,
        scope: &FrameScope<'_>,
        walk: &mut Walk,
        pictures: &mut Pictures<'_>,
    ) -> M4vResult<()> {
        let header = symbols.macroblock(cursor, scope.frame)?;
        let qp = if header.mode == MacroblockMode::Skipped {
            walk.qp
        } else {
            scope.apply_dquant(walk.qp, header.dquant)
        };
        self.reconstruct_macroblock(cursor, symbols, scope, walk, qp, &header, None, pictures)?;
        walk.qp = qp;
        walk.mb += 1;
        walk.decoded += 1;
        Ok(())
    }

    /// 重建宏块 `walk.mb` 的 6 个块
    ///
    /// `dc` 为数据分区中预先读出的 DC 差值.
    #[allow(clippy::too_many_arguments)]
    fn reconstruct_macroblock<D: SymbolDecoder + ?Sized>(
        &mut self,
        cursor: &mut BitCursor,
        symbols: &mut D,
        scope: &FrameScope<'_>,
        walk: &Walk,
        qp: u32,
        header: &MacroblockHeader,
        dc: Option<&[i32; 6]>,
        pictures: &mut Pictures<'_>,
    ) -> M4vResult<()> {
        let mb = walk.mb;
        if header.mode == MacroblockMode::Skipped {
            self.ctx.set_info(
                mb,
                MacroblockInfo {
                    qp,
                    slice: walk.slice,
                    ..MacroblockInfo::default()
                },
            );
            self.blocks[mb] = [[0; 64]; 6];
            let cols = scope.layer.mb_cols;
            return pictures.repeat_macroblock(mb % cols, mb / cols);
        }

        let info = MacroblockInfo {
            mode: header.mode,
            qp,
            cbp: header.cbp,
            slice: walk.slice,
            ac_pred: header.ac_pred && header.mode == MacroblockMode::Intra,
        };
        self.ctx.set_info(mb, info);
        let dc_source = scope.rec.dc_source(qp);
        for block in 0..6 {
            let coded = info.block_coded(block);
            let out = &mut self.blocks[mb][block];
            if header.mode == MacroblockMode::Intra {
                let dc = match (dc, dc_source) {
                    (Some(diffs), DcSource::Read) => DcSource::Decoded(diffs[block]),
                    (_, source) => source,
                };
                let request = IntraBlock {
                    mb,
                    block,
                    qp,
                    coded,
                    ac_pred: info.ac_pred,
                    dc,
                };
                scope
                    .rec
                    .intra_block(cursor, symbols, &mut self.ctx, request, out)?;
            } else if coded {
                scope.rec.inter_block(cursor, symbols, qp, out)?;
            } else {
                *out = [0; 64];
            }
        }
        trace!("宏块 {}: {:?}, qp={}, cbp=0x{:02X}", mb, header.mode, qp, header.cbp);
        Ok(())
    }

    /// 进入新的同步单元, 隐藏被跳过的宏块
    fn enter_unit(
        &mut self,
        header: &ResyncHeader,
        walk: &mut Walk,
        pictures: &mut Pictures<'_>,
    ) -> M4vResult<()> {
        if header.mb_number < walk.mb {
            return Err(M4vError::InvalidData(format!(
                "同步单元起始宏块 {} 早于当前宏块 {}",
                header.mb_number, walk.mb
            )));
        }
        if header.mb_number > walk.mb {
            debug!("同步单元跳过宏块 [{}, {})", walk.mb, header.mb_number);
            self.conceal_range(walk, header.mb_number, pictures)?;
        }
        walk.slice += 1;
        walk.qp = header.quant;
        walk.mb = header.mb_number;
        walk.units += 1;
        Ok(())
    }

    fn conceal_range(
        &mut self,
        walk: &Walk,
        end: usize,
        pictures: &mut Pictures<'_>,
    ) -> M4vResult<usize> {
        let reference = pictures.usable_reference();
        self.conceal.conceal_range(
            &mut self.ctx,
            pictures.current,
            reference,
            walk.mb..end,
            walk.slice,
            &mut self.blocks,
        )
    }

    fn conceal_rest(&mut self, walk: &mut Walk, pictures: &mut Pictures<'_>) -> M4vResult<()> {
        let total = self.ctx.total_mbs();
        self.conceal_range(walk, total, pictures)?;
        walk.mb = total;
        Ok(())
    }

    /// 宏块 `walk.mb` 失败后重新同步
    ///
    /// 搜索到同步标记时隐藏失败宏块至新单元首宏块之间的区域并继续;
    /// 遇到起始码或数据耗尽时隐藏剩余宏块并结束本帧.
    fn recover(
        &mut self,
        parser: &mut HeaderParser,
        cursor: &mut BitCursor,
        scope: &FrameScope<'_>,
        walk: &mut Walk,
        pictures: &mut Pictures<'_>,
    ) -> M4vResult<Recovery> {
        self.conceal.on_failure(walk.mb, cursor.position());
        let marker_len = parser.resync_marker_len();
        loop {
            match self
                .conceal
                .realign(cursor, marker_len, scope.max_scan_bytes)
            {
                Ok(ResyncPoint::Marker) => {
                    let at = cursor.position();
                    match parser.parse_resync_header_at_marker(cursor) {
                        Ok(header) if header.mb_number >= walk.mb => {
                            self.enter_unit(&header, walk, pictures)?;
                            return Ok(Recovery::Resume);
                        }
                        Ok(header) => {
                            debug!(
                                "忽略起始宏块 {} 的同步单元 (失败宏块 {})",
                                header.mb_number, walk.mb
                            );
                        }
                        Err(M4vError::EndOfUnit) => {
                            self.conceal_rest(walk, pictures)?;
                            let status = if cursor.at_end() {
                                Status::EndOfUnit
                            } else {
                                Status::Success
                            };
                            return Ok(Recovery::Finished(status));
                        }
                        Err(err) => {
                            debug!("位 {} 处的同步单元头无效: {}", at, err);
                            if cursor.position() <= at {
                                cursor.seek(at + 8);
                            }
                        }
                    }
                }
                Ok(ResyncPoint::StartCode) => {
                    self.conceal_rest(walk, pictures)?;
                    return Ok(Recovery::Finished(Status::Success));
                }
                Err(M4vError::EndOfUnit) => {
                    self.conceal_rest(walk, pictures)?;
                    return Ok(Recovery::Finished(Status::EndOfUnit));
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// 数据分区模式
    fn decode_partitioned<D: SymbolDecoder + ?Sized>(
        &mut self,
        parser: &mut HeaderParser,
        cursor: &mut BitCursor,
        symbols: &mut D,
        scope: &FrameScope<'_>,
        walk: &mut Walk,
        pictures: &mut Pictures<'_>,
    ) -> M4vResult<Status> {
        let total = scope.layer.total_mbs;
        loop {
            let packet_start = walk.mb;
            let packet_decoded = walk.decoded;
            let packet_pos = cursor.position();
            let packet = if cursor.at_end() || at_start_code(cursor) {
                Err(M4vError::EndOfUnit)
            } else {
                self.decode_packet(cursor, symbols, scope, walk, pictures)
            };
            let step = match packet {
                Ok(()) if walk.mb >= total => return Ok(Status::Success),
                Ok(()) => self.next_packet(parser, cursor, walk, pictures),
                Err(err) => {
                    // 分区内无法定位宏块边界, 整个 packet 作废, 从 packet 起点重新同步
                    walk.mb = packet_start;
                    walk.decoded = packet_decoded;
                    cursor.seek(packet_pos);
                    Err(err)
                }
            };
            match step {
                Ok(()) => {}
                Err(M4vError::EndOfUnit) => {
                    self.conceal_rest(walk, pictures)?;
                    return Ok(Status::EndOfUnit);
                }
                Err(err) => {
                    if !scope.conceal_errors {
                        return Err(err);
                    }
                    debug!("video packet (宏块 {} 起) 出错: {}", walk.mb, err);
                    if let Recovery::Finished(status) =
                        self.recover(parser, cursor, scope, walk, pictures)?
                    {
                        return Ok(status);
                    }
                }
            }
        }
    }

    /// packet 结束后必须紧跟同步标记
    fn next_packet(
        &mut self,
        parser: &mut HeaderParser,
        cursor: &mut BitCursor,
        walk: &mut Walk,
        pictures: &mut Pictures<'_>,
    ) -> M4vResult<()> {
        if parser.check_resync_marker(cursor) {
            let header = parser.parse_resync_header(cursor)?;
            return self.enter_unit(&header, walk, pictures);
        }
        if cursor.at_end() || at_start_code(cursor) {
            return Err(M4vError::EndOfUnit);
        }
        Err(M4vError::InvalidData(format!(
            "宏块 {} 前缺少同步标记 (位 {})",
            walk.mb,
            cursor.position()
        )))
    }

    fn decode_packet<D: SymbolDecoder + ?Sized>(
        &mut self,
        cursor: &mut BitCursor,
        symbols: &mut D,
        scope: &FrameScope<'_>,
        walk: &mut Walk,
        pictures: &mut Pictures<'_>,
    ) -> M4vResult<()> {
        let intra_frame = scope.frame.picture_type == PictureType::I;
        let (pattern, pattern_len) = if intra_frame {
            (DC_MARKER, DC_MARKER_LEN)
        } else {
            (MOTION_MARKER, MOTION_MARKER_LEN)
        };

        // 先定位分区 A 的结束位置
        let mut probe = cursor.clone();
        marker::quick_search(&mut probe, pattern, pattern_len).map_err(|_| {
            M4vError::InvalidData(format!("位 {} 之后缺少分区标记", cursor.position()))
        })?;
        let boundary = probe.position();

        let total = scope.layer.total_mbs;
        let mut qp = walk.qp;
        let mut entries: Vec<PartitionEntry> = Vec::new();
        while cursor.position() < boundary {
            if walk.mb + entries.len() >= total {
                return Err(M4vError::InvalidData(format!("分区 A 宏块数超过 {}", total)));
            }
            let header = symbols.macroblock(cursor, scope.frame)?;
            let mut entry = PartitionEntry { header, qp, dc: None };
            if intra_frame {
                if header.mode != MacroblockMode::Skipped {
                    qp = scope.apply_dquant(qp, header.dquant);
                }
                entry.qp = qp;
                if header.mode == MacroblockMode::Intra && scope.rec.dc_source(qp) == DcSource::Read
                {
                    entry.dc = Some(read_dc_diffs(cursor, symbols)?);
                }
            }
            entries.push(entry);
        }
        if cursor.position() != boundary {
            return Err(M4vError::InvalidData(format!(
                "分区 A 越过标记: 位 {} > {}",
                cursor.position(),
                boundary
            )));
        }
        cursor.flush(pattern_len as usize);
        trace!("分区 A: 宏块 [{}, {})", walk.mb, walk.mb + entries.len());

        for entry in entries.iter_mut() {
            if entry.header.mode == MacroblockMode::Skipped {
                continue;
            }
            symbols.partition_header(cursor, &mut entry.header)?;
            if !intra_frame {
                qp = scope.apply_dquant(qp, entry.header.dquant);
                entry.qp = qp;
                if entry.header.mode == MacroblockMode::Intra
                    && scope.rec.dc_source(qp) == DcSource::Read
                {
                    entry.dc = Some(read_dc_diffs(cursor, symbols)?);
                }
            }
        }

        for entry in &entries {
            self.reconstruct_macroblock(
                cursor,
                symbols,
                scope,
                walk,
                entry.qp,
                &entry.header,
                entry.dc.as_ref(),
                pictures,
            )?;
            walk.mb += 1;
            walk.decoded += 1;
        }
        walk.qp = qp;
        Ok(())
    }
}

fn read_dc_diffs<D: SymbolDecoder + ?Sized>(
    cursor: &mut BitCursor,
    symbols: &mut D,
) -> M4vResult<[i32; 6]> {
    let mut diffs = [0i32; 6];
    for (block, diff) in diffs.iter_mut().enumerate() {
        *diff = symbols.intra_dc_diff(cursor, block < 4)?;
    }
    Ok(diffs)
}

/// 游标之后是否为 (经填充对齐的) 起始码
fn at_start_code(cursor: &mut BitCursor) -> bool {
    cursor.peek_byte_aligned(24, true) == Some(1) || cursor.peek_byte_aligned(24, false) == Some(1)
}
