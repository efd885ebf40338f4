//! 单元测试共用的脚本化符号解码器与码流构造函数

use std::collections::VecDeque;

use m4v_core::bitwriter::BitWriter;
use m4v_core::{BitCursor, M4vError, M4vResult};

use crate::entropy::{EntropyStrategy, MacroblockHeader, RunLevel, SymbolDecoder};
use crate::header::{FrameHeader, START_CODE_VOL_FIRST, START_CODE_VOP, START_CODE_VOS};

/// 构造系数符号, `level` 为负时置符号位
pub(crate) fn coef(run: u8, level: i32, last: bool) -> RunLevel {
    RunLevel {
        run,
        level: level.abs(),
        sign: level < 0,
        last,
    }
}

/// 按脚本依次返回符号; 宏块头消耗固定位数以推进游标
#[derive(Debug, Default)]
pub(crate) struct ScriptedSymbols {
    pub macroblocks: VecDeque<M4vResult<MacroblockHeader>>,
    pub dc_diffs: VecDeque<i32>,
    pub coefficients: VecDeque<M4vResult<RunLevel>>,
    pub mb_bits: usize,
    /// 每次取系数时使用的策略
    pub strategies: Vec<EntropyStrategy>,
}

impl ScriptedSymbols {
    pub fn new(mb_bits: usize) -> Self {
        Self {
            mb_bits,
            ..Self::default()
        }
    }

    pub fn push_mb(&mut self, header: MacroblockHeader) -> &mut Self {
        self.macroblocks.push_back(Ok(header));
        self
    }

    pub fn push_coef(&mut self, run: u8, level: i32, last: bool) -> &mut Self {
        self.coefficients.push_back(Ok(coef(run, level, last)));
        self
    }
}

impl SymbolDecoder for ScriptedSymbols {
    fn macroblock(
        &mut self,
        cursor: &mut BitCursor,
        _frame: &FrameHeader,
    ) -> M4vResult<MacroblockHeader> {
        let header = self
            .macroblocks
            .pop_front()
            .unwrap_or_else(|| Err(M4vError::Entropy("宏块脚本已耗尽".into())))?;
        cursor.flush(self.mb_bits);
        Ok(header)
    }

    fn intra_dc_diff(&mut self, _cursor: &mut BitCursor, _is_luma: bool) -> M4vResult<i32> {
        self.dc_diffs
            .pop_front()
            .ok_or_else(|| M4vError::Entropy("DC 脚本已耗尽".into()))
    }

    fn coefficient(
        &mut self,
        _cursor: &mut BitCursor,
        strategy: EntropyStrategy,
    ) -> M4vResult<RunLevel> {
        self.strategies.push(strategy);
        self.coefficients
            .pop_front()
            .unwrap_or_else(|| Err(M4vError::Entropy("系数脚本已耗尽".into())))
    }
}

/// VOL 构造参数
pub(crate) struct VolParams {
    pub aspect: u32,
    pub width: u32,
    pub height: u32,
    pub time_resolution: u32,
    pub intra_matrix: Option<Vec<u32>>,
    pub complexity: bool,
    pub resync_disable: bool,
    pub data_partitioned: bool,
    pub scalability: bool,
}

impl Default for VolParams {
    fn default() -> Self {
        Self {
            aspect: 1,
            width: 176,
            height: 144,
            time_resolution: 30,
            intra_matrix: None,
            complexity: false,
            resync_disable: false,
            data_partitioned: false,
            scalability: false,
        }
    }
}

pub(crate) fn write_vos(bw: &mut BitWriter, profile: u8) {
    bw.write_start_code(START_CODE_VOS);
    bw.write_bits(u32::from(profile), 8);
    bw.write_start_code(0x00);
}

pub(crate) fn write_vol(bw: &mut BitWriter, p: &VolParams) {
    bw.write_start_code(START_CODE_VOL_FIRST);
    bw.write_bits(0, 1); // random_accessible_vol
    bw.write_bits(1, 8); // video_object_type
    bw.write_bits(0, 1); // is_object_layer_identifier
    bw.write_bits(p.aspect, 4);
    bw.write_bits(0, 1); // vol_control_parameters
    bw.write_bits(0, 2); // 矩形
    bw.write_marker();
    bw.write_bits(p.time_resolution, 16);
    bw.write_marker();
    bw.write_bits(0, 1); // fixed_vop_rate
    bw.write_marker();
    bw.write_bits(p.width, 13);
    bw.write_marker();
    bw.write_bits(p.height, 13);
    bw.write_marker();
    bw.write_bits(0, 1); // interlaced
    bw.write_bits(1, 1); // obmc_disable
    bw.write_bits(0, 1); // sprite_enable
    bw.write_bits(0, 1); // not_8_bit
    match &p.intra_matrix {
        Some(values) => {
            bw.write_bits(1, 1); // quant_type
            bw.write_bits(1, 1); // load_intra_quant_mat
            for &v in values {
                bw.write_bits(v, 8);
            }
            bw.write_bits(0, 1); // load_inter_quant_mat
        }
        None => bw.write_bits(0, 1),
    }
    if p.complexity {
        bw.write_bits(0, 1); // complexity_estimation_disable
        bw.write_bits(0, 2); // method
        bw.write_bits(1, 1); // shape 禁用
        bw.write_bits(0, 1); // 纹理集 1 启用
        bw.write_bits(0b1101, 4); // intra, inter, inter4v, not_coded
        bw.write_marker();
        bw.write_bits(1, 1); // 纹理集 2 禁用
        bw.write_bits(0, 1); // 运动补偿启用
        bw.write_bits(0b100000, 6); // apm
        bw.write_marker();
    } else {
        bw.write_bits(1, 1);
    }
    bw.write_flag(p.resync_disable);
    bw.write_flag(p.data_partitioned);
    if p.data_partitioned {
        bw.write_bits(0, 1); // reversible_vlc
    }
    if p.scalability {
        bw.write_bits(1, 1);
        bw.write_bits(1, 1); // hierarchy_type
        bw.write_bits(0, 4); // ref_layer_id
        bw.write_bits(0, 1);
        bw.write_bits(1, 5);
        bw.write_bits(1, 5);
        bw.write_bits(1, 5);
        bw.write_bits(1, 5);
        bw.write_bits(0, 1); // enhancement_type
    } else {
        bw.write_bits(0, 1);
    }
}

/// time_increment 为 5 位 (分辨率 30)
pub(crate) fn write_vop(
    bw: &mut BitWriter,
    code: u32,
    modulo: u32,
    coded: bool,
    quant: u32,
    fcode: u32,
) {
    bw.write_start_code(START_CODE_VOP);
    bw.write_bits(code, 2);
    bw.write_unary_ones(modulo);
    bw.write_marker();
    bw.write_bits(7, 5);
    bw.write_marker();
    bw.write_flag(coded);
    if !coded {
        return;
    }
    if code == 1 {
        bw.write_bits(0, 1); // rounding
    }
    bw.write_bits(0, 3); // intra_dc_vlc_thr
    bw.write_bits(quant, 5);
    if code != 0 {
        bw.write_bits(fcode, 3);
    }
    if code == 2 {
        bw.write_bits(fcode, 3);
    }
}

pub(crate) fn stream(build: impl FnOnce(&mut BitWriter)) -> Vec<u8> {
    let mut bw = BitWriter::new();
    build(&mut bw);
    bw.finish()
}
