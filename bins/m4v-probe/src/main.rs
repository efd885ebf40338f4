//! m4v-probe - 基本流头部探测工具
//!
//! 读取整个 MPEG-4 Part 2 (.m4v) 或 H.263 基本流, 依次报告层配置、每帧帧头
//! 以及帧内字节对齐的同步单元头. 不做熵解码.

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{debug, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};

use m4v_codec::header::ResyncKind;
use m4v_codec::marker::{self, ResyncPoint};
use m4v_codec::{DecoderOptions, HeaderParser};
use m4v_core::{BitCursor, M4vError};

/// 基本流头部探测工具
#[derive(Parser, Debug)]
#[command(name = "m4v-probe", version, about = "MPEG-4 Part 2 / H.263 基本流头部探测")]
struct Cli {
    /// 输入基本流路径
    input: PathBuf,

    /// 解码选项 JSON 文件
    #[arg(long)]
    options: Option<PathBuf>,

    /// 不扫描帧内同步单元
    #[arg(long)]
    no_resync: bool,

    /// 最多报告的帧数
    #[arg(long)]
    max_frames: Option<usize>,

    /// 输出 JSON 格式
    #[arg(long)]
    json: bool,
}

/// 完整探测结果
#[derive(Debug, Serialize)]
struct ProbeOutput {
    filename: String,
    size: usize,
    layer: LayerInfo,
    frames: Vec<FrameInfo>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    errors: Vec<String>,
}

/// 层信息
#[derive(Debug, Serialize)]
struct LayerInfo {
    short_header: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    profile_level: Option<u8>,
    width: u32,
    height: u32,
    coded_width: u32,
    coded_height: u32,
    macroblocks: usize,
    time_increment_resolution: u32,
    quant_type: String,
    data_partitioned: bool,
    resync_marker_disable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    issue: Option<String>,
}

/// 帧信息
#[derive(Debug, Serialize)]
struct FrameInfo {
    index: usize,
    offset: usize,
    picture_type: String,
    coded: bool,
    quant: u32,
    timestamp: u64,
    resync_units: Vec<UnitInfo>,
}

/// 同步单元信息
#[derive(Debug, Serialize)]
struct UnitInfo {
    offset: usize,
    mb_number: usize,
    quant: u32,
    kind: String,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(err) = run(&cli) {
        eprintln!("错误: {err:#}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let options = match &cli.options {
        Some(path) => load_options(path)?,
        None => DecoderOptions::default(),
    };
    let data = std::fs::read(&cli.input)
        .with_context(|| format!("无法读取文件 '{}'", cli.input.display()))?;
    let output = probe(
        &cli.input.display().to_string(),
        &data,
        options,
        !cli.no_resync,
        cli.max_frames,
    )?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_text(&output);
    }
    Ok(())
}

fn load_options(path: &Path) -> Result<DecoderOptions> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("无法读取选项文件 '{}'", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("选项文件 '{}' 格式错误", path.display()))
}

fn probe(
    filename: &str,
    data: &[u8],
    options: DecoderOptions,
    scan_resync: bool,
    max_frames: Option<usize>,
) -> Result<ProbeOutput> {
    let mut parser = HeaderParser::new(options);
    let mut cursor = BitCursor::new(data);

    let issue = match parser.parse_configuration(&mut cursor, 0) {
        Ok(_) => None,
        Err(M4vError::RecoverableHeader(detail)) => Some(detail),
        Err(err) => bail!("层配置解析失败: {err}"),
    };
    let Some(layer) = parser.layer() else {
        bail!("码流中没有层配置");
    };
    let layer_info = LayerInfo {
        short_header: layer.short_header.is_some(),
        profile_level: parser.profile_level(),
        width: layer.display_width,
        height: layer.display_height,
        coded_width: layer.width,
        coded_height: layer.height,
        macroblocks: layer.total_mbs,
        time_increment_resolution: layer.time_increment_resolution,
        quant_type: format!("{:?}", layer.quant_type),
        data_partitioned: layer.data_partitioned,
        resync_marker_disable: layer.resync_marker_disable,
        issue,
    };

    let mut frames = Vec::new();
    let mut errors = Vec::new();
    while max_frames.is_none_or(|max| frames.len() < max) {
        let before = cursor.position();
        let frame = match parser.parse_frame(&mut cursor) {
            Ok(frame) => frame,
            Err(M4vError::EndOfUnit) => break,
            Err(err) => {
                warn!("位 {} 之后的帧头无效: {}", before, err);
                errors.push(format!("字节 {}: {}", before / 8, err));
                // 跳过无效起始码继续探测
                cursor.seek(cursor.position().max(before) + 8);
                continue;
            }
        };
        let resolution = parser
            .layer()
            .map_or(1, |layer| layer.time_increment_resolution.max(1));
        let mut info = FrameInfo {
            index: frames.len(),
            offset: before.div_ceil(8),
            picture_type: format!("{:?}", frame.picture_type),
            coded: frame.coded,
            quant: frame.quant,
            timestamp: frame.timestamp_ticks(resolution),
            resync_units: Vec::new(),
        };
        if scan_resync && frame.coded {
            info.resync_units = scan_units(&mut parser, &mut cursor);
        }
        debug!(
            "帧 {}: {} coded={} 同步单元 {}",
            info.index,
            info.picture_type,
            info.coded,
            info.resync_units.len()
        );
        frames.push(info);
    }

    Ok(ProbeOutput {
        filename: filename.to_string(),
        size: data.len(),
        layer: layer_info,
        frames,
        errors,
    })
}

/// 扫描本帧剩余数据中的同步单元头, 游标停在下一个起始码 (或末尾)
fn scan_units(parser: &mut HeaderParser, cursor: &mut BitCursor) -> Vec<UnitInfo> {
    let marker_len = parser.resync_marker_len();
    let mut units = Vec::new();
    loop {
        match marker::search_resync_point(cursor, marker_len, None) {
            Ok(ResyncPoint::Marker) => {
                let at = cursor.position();
                match parser.parse_resync_header_at_marker(cursor) {
                    Ok(header) => units.push(UnitInfo {
                        offset: at / 8,
                        mb_number: header.mb_number,
                        quant: header.quant,
                        kind: unit_kind(&header.kind),
                    }),
                    // 下一图像的起始码
                    Err(M4vError::EndOfUnit) => break,
                    Err(err) => {
                        debug!("字节 {} 处的同步单元头无效: {}", at / 8, err);
                        cursor.seek(at + 8);
                    }
                }
            }
            Ok(ResyncPoint::StartCode) | Err(_) => break,
        }
    }
    units
}

fn unit_kind(kind: &ResyncKind) -> String {
    match kind {
        ResyncKind::VideoPacket { extension: Some(_) } => "video_packet+hec".to_string(),
        ResyncKind::VideoPacket { extension: None } => "video_packet".to_string(),
        ResyncKind::Gob { number, .. } => format!("gob {number}"),
        ResyncKind::Slice { .. } => "slice".to_string(),
    }
}

fn print_text(output: &ProbeOutput) {
    println!("文件: {} ({} 字节)", output.filename, output.size);
    let layer = &output.layer;
    println!(
        "层: {}x{} (编码 {}x{}, {} 宏块), {}",
        layer.width,
        layer.height,
        layer.coded_width,
        layer.coded_height,
        layer.macroblocks,
        if layer.short_header { "H.263 短头" } else { "MPEG-4 Part 2" }
    );
    if let Some(profile) = layer.profile_level {
        println!("  profile/level: 0x{profile:02X}");
    }
    println!(
        "  时间分辨率: {}, 量化: {}, 数据分区: {}, 同步标记: {}",
        layer.time_increment_resolution,
        layer.quant_type,
        layer.data_partitioned,
        if layer.resync_marker_disable { "禁用" } else { "启用" }
    );
    if let Some(issue) = &layer.issue {
        println!("  警告: {issue}");
    }
    for frame in &output.frames {
        println!(
            "帧 {:>5} @{:>8}: {} coded={} quant={:>2} ts={} 同步单元={}",
            frame.index,
            frame.offset,
            frame.picture_type,
            frame.coded,
            frame.quant,
            frame.timestamp,
            frame.resync_units.len()
        );
        for unit in &frame.resync_units {
            println!(
                "    @{:>8}: {} 宏块 {} quant {}",
                unit.offset, unit.kind, unit.mb_number, unit.quant
            );
        }
    }
    for err in &output.errors {
        println!("错误: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use m4v_core::bitwriter::BitWriter;

    /// 32x16 的 I-VOP 码流, 含一个 video packet
    fn sample() -> Vec<u8> {
        let mut bw = BitWriter::new();
        bw.write_start_code(0xB0);
        bw.write_bits(0x01, 8);
        bw.write_start_code(0x00);
        bw.write_start_code(0x20);
        bw.write_bits(0, 1);
        bw.write_bits(1, 8);
        bw.write_bits(0, 1);
        bw.write_bits(1, 4);
        bw.write_bits(0, 1);
        bw.write_bits(0, 2);
        bw.write_marker();
        bw.write_bits(30, 16);
        bw.write_marker();
        bw.write_bits(0, 1);
        bw.write_marker();
        bw.write_bits(32, 13);
        bw.write_marker();
        bw.write_bits(16, 13);
        bw.write_marker();
        bw.write_bits(0b0100, 4); // interlaced, obmc_disable, sprite, not_8_bit
        bw.write_bits(0, 1); // quant_type
        bw.write_bits(1, 1); // complexity_estimation_disable
        bw.write_bits(0, 3); // resync_disable, data_partitioned, scalability
        bw.write_start_code(0xB6);
        bw.write_bits(0, 2);
        bw.write_bits(0, 1); // modulo_time_base
        bw.write_marker();
        bw.write_bits(7, 5);
        bw.write_marker();
        bw.write_bits(1, 1);
        bw.write_bits(0, 3);
        bw.write_bits(4, 5);
        bw.write_bits(0xA5, 8);
        bw.write_stuffing();
        bw.write_bits(1, 17);
        bw.write_bits(1, 1); // mb_number (1 位)
        bw.write_bits(9, 5);
        bw.write_bits(0, 1);
        bw.write_bits(0xA5, 8);
        bw.finish()
    }

    #[test]
    fn test_probe_reports_frames_and_units() {
        let output = probe("sample.m4v", &sample(), DecoderOptions::default(), true, None).unwrap();
        assert_eq!(output.layer.profile_level, Some(0x01));
        assert_eq!((output.layer.width, output.layer.height), (32, 16));
        assert_eq!(output.layer.macroblocks, 2);
        assert_eq!(output.frames.len(), 1);
        let frame = &output.frames[0];
        assert_eq!(frame.picture_type, "I");
        assert_eq!(frame.quant, 4);
        assert_eq!(frame.resync_units.len(), 1, "应找到一个 video packet");
        assert_eq!(frame.resync_units[0].mb_number, 1);
        assert_eq!(frame.resync_units[0].quant, 9);
        assert!(output.errors.is_empty());
    }

    #[test]
    fn test_probe_without_configuration_fails() {
        assert!(probe("empty", &[0u8; 4], DecoderOptions::default(), true, None).is_err());
    }

    #[test]
    fn test_load_options_file() {
        let dir = match tempfile::TempDir::new() {
            Ok(dir) => dir,
            Err(err) => panic!("创建临时目录失败: {}", err),
        };
        let path = dir.path().join("options.json");
        std::fs::write(&path, r#"{ "tolerant": true }"#).unwrap();
        let options = load_options(&path).unwrap();
        assert!(options.tolerant);
        assert!(options.conceal_errors);
    }
}
