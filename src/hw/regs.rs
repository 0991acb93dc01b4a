//! Register offsets and bitfields of the capture blocks.
//!
//! Offsets are relative to each block's base (see
//! [`crate::platform::RegisterLayout`]).

#![allow(non_snake_case)]

/// CSIC top: global enable and the parser → ISP bridge.
pub mod top {
    use tock_registers::register_bitfields;

    pub mod off {
        pub const EN: u32 = 0x000;
        /// One enable bit per ISP instance.
        pub const ISP_BRIDGE: u32 = 0x004;
        /// One bit per parser: parser output routed through TDM.
        pub const TDM_ROUTE: u32 = 0x008;
    }

    register_bitfields![u32,
        pub TOP_EN [
            EN OFFSET(0) NUMBITS(1) [],
            VER_EN OFFSET(1) NUMBITS(1) []
        ]
    ];
}

pub mod parser {
    use tock_registers::register_bitfields;

    pub mod off {
        pub const EN: u32 = 0x000;
        pub const IF_CFG: u32 = 0x004;
        pub const MIPI_IF_CFG: u32 = 0x008;
        pub const CAP: u32 = 0x00c;
        pub const SIGNAL_STA: u32 = 0x010;

        pub const fn ch_hsize(ch: usize) -> u32 {
            0x020 + ch as u32 * 0x8
        }

        pub const fn ch_vsize(ch: usize) -> u32 {
            0x024 + ch as u32 * 0x8
        }

        pub const fn ch_input(ch: usize) -> u32 {
            0x080 + ch as u32 * 0x10
        }
    }

    /// Still-capture enable bit of channel `ch` in `CAP`.
    pub const fn cap_still_bit(ch: usize) -> u32 {
        ch as u32 * 8
    }

    /// Video-capture enable bit of channel `ch` in `CAP`.
    pub const fn cap_video_bit(ch: usize) -> u32 {
        ch as u32 * 8 + 1
    }

    register_bitfields![u32,
        pub PRS_EN [
            EN OFFSET(0) NUMBITS(1) [],
            MODE OFFSET(1) NUMBITS(1) [
                Normal = 0,
                Tdm = 1
            ],
            NCSIC_EN OFFSET(2) NUMBITS(1) [],
            MCSIC_EN OFFSET(3) NUMBITS(1) []
        ],
        pub IF_CFG [
            INPUT_SEQ OFFSET(0) NUMBITS(2) [
                Yuyv = 0,
                Yvyu = 1,
                Uyvy = 2,
                Vyuy = 3
            ],
            IF_MODE OFFSET(4) NUMBITS(3) [
                Parallel = 0,
                Bt656 = 1,
                Bt1120 = 2
            ],
            DATA_WIDTH OFFSET(8) NUMBITS(2) [
                Bits8 = 0,
                Bits10 = 1,
                Bits12 = 2,
                Bits16 = 3
            ],
            SRC_TYPE OFFSET(12) NUMBITS(1) [
                Progressive = 0,
                Interlaced = 1
            ],
            CLK_POL OFFSET(16) NUMBITS(1) [],
            HREF_POL OFFSET(17) NUMBITS(1) [],
            VREF_POL OFFSET(18) NUMBITS(1) [],
            FIELD_POL OFFSET(19) NUMBITS(1) [],
            OUTPUT_MODE OFFSET(20) NUMBITS(2) [
                Yuv = 0,
                Raw = 1
            ],
            CH_NUM OFFSET(24) NUMBITS(2) []
        ],
        pub MIPI_IF_CFG [
            CH_NUM OFFSET(0) NUMBITS(2) [],
            SEQ OFFSET(4) NUMBITS(2) []
        ],
        pub SIGNAL_STA [
            HSYNC OFFSET(0) NUMBITS(1) [],
            VSYNC OFFSET(1) NUMBITS(1) [],
            FIELD OFFSET(2) NUMBITS(1) [],
            BUSY OFFSET(31) NUMBITS(1) []
        ],
        pub CH_WIN [
            START OFFSET(0) NUMBITS(13) [],
            LEN OFFSET(16) NUMBITS(13) []
        ],
        pub CH_INPUT [
            WIDTH OFFSET(0) NUMBITS(15) [],
            HEIGHT OFFSET(16) NUMBITS(15) []
        ]
    ];
}

pub mod mipi {
    use tock_registers::register_bitfields;

    pub mod off {
        pub const CTRL: u32 = 0x000;
        pub const DT: u32 = 0x004;
    }

    register_bitfields![u32,
        pub CTRL [
            EN OFFSET(0) NUMBITS(1) [],
            LANES OFFSET(4) NUMBITS(2) []
        ],
        pub DT [
            DATA_TYPE OFFSET(0) NUMBITS(6) [],
            VC_NUM OFFSET(8) NUMBITS(2) []
        ]
    ];
}

pub mod tdm {
    use tock_registers::register_bitfields;

    pub mod off {
        pub const TOP: u32 = 0x000;

        pub const fn rx_cfg(rx: usize) -> u32 {
            0x010 + rx as u32 * 0x10
        }

        pub const fn rx_size(rx: usize) -> u32 {
            0x014 + rx as u32 * 0x10
        }

        pub const fn rx_addr(rx: usize, slot: usize) -> u32 {
            0x100 + rx as u32 * 0x20 + slot as u32 * 4
        }
    }

    register_bitfields![u32,
        pub TDM_TOP [
            EN OFFSET(0) NUMBITS(1) []
        ],
        pub RX_CFG [
            EN OFFSET(0) NUMBITS(1) [],
            BUF_NUM OFFSET(4) NUMBITS(3) []
        ]
    ];
}

pub mod isp {
    use tock_registers::register_bitfields;

    pub mod off {
        pub const FE_CFG: u32 = 0x000;
        pub const FE_CTRL: u32 = 0x004;
        pub const INT_EN: u32 = 0x008;
        pub const INT_STA: u32 = 0x00c;
        pub const LOAD_ADDR: u32 = 0x010;
        pub const SAVE_ADDR: u32 = 0x014;
        pub const STAT_ADDR: u32 = 0x018;
        pub const IN_SIZE: u32 = 0x020;
        pub const OB_SIZE: u32 = 0x024;
        pub const OB_VALID: u32 = 0x028;
        pub const OB_START: u32 = 0x02c;
        pub const D3D_LBC: u32 = 0x060;
        pub const WDR_LBC: u32 = 0x064;

        pub const fn d3d_addr(role: usize) -> u32 {
            0x040 + role as u32 * 4
        }

        pub const fn wdr_addr(role: usize) -> u32 {
            0x050 + role as u32 * 4
        }

        pub const fn ch_size(ch: usize) -> u32 {
            0x080 + ch as u32 * 4
        }
    }

    register_bitfields![u32,
        pub FE_CFG [
            EN OFFSET(0) NUMBITS(1) [],
            WDR_MODE OFFSET(4) NUMBITS(2) [
                Linear = 0,
                TwoFrame = 1,
                Dol = 2
            ],
            D3D_EN OFFSET(8) NUMBITS(1) [],
            WDR_EN OFFSET(9) NUMBITS(1) [],
            LBC_EN OFFSET(10) NUMBITS(1) [],
            SPLIT_EN OFFSET(11) NUMBITS(1) []
        ],
        pub FE_CTRL [
            CAP_EN OFFSET(0) NUMBITS(1) [],
            PARA_READY OFFSET(1) NUMBITS(1) []
        ],
        pub INT [
            FINISH OFFSET(0) NUMBITS(1) [],
            START OFFSET(1) NUMBITS(1) [],
            PARA_SAVE OFFSET(2) NUMBITS(1) [],
            PARA_LOAD OFFSET(3) NUMBITS(1) [],
            SRC0_FIFO_OF OFFSET(4) NUMBITS(1) [],
            FRAME_ERROR OFFSET(5) NUMBITS(1) [],
            FRAME_LOST OFFSET(6) NUMBITS(1) [],
            DDR_RW_ERROR OFFSET(7) NUMBITS(1) [],
            LBC_ERROR OFFSET(8) NUMBITS(1) [],
            HB_SHORT OFFSET(9) NUMBITS(1) [],
            CFG_MISMATCH OFFSET(10) NUMBITS(1) []
        ],
        pub LBC [
            BW_LIMIT OFFSET(0) NUMBITS(12) [],
            SAT OFFSET(16) NUMBITS(10) [],
            LOSSY OFFSET(31) NUMBITS(1) []
        ],
        pub SIZE [
            WIDTH OFFSET(0) NUMBITS(14) [],
            HEIGHT OFFSET(16) NUMBITS(14) []
        ],
        pub OB_START [
            HOR OFFSET(0) NUMBITS(14) [],
            VER OFFSET(16) NUMBITS(14) []
        ]
    ];

    pub const INT_FINISH: u32 = 1 << 0;
    pub const INT_START: u32 = 1 << 1;
    pub const INT_PARA_SAVE: u32 = 1 << 2;
    pub const INT_PARA_LOAD: u32 = 1 << 3;
    pub const INT_SRC0_FIFO_OF: u32 = 1 << 4;
    pub const INT_FRAME_ERROR: u32 = 1 << 5;
    pub const INT_FRAME_LOST: u32 = 1 << 6;
    pub const INT_DDR_RW_ERROR: u32 = 1 << 7;
    pub const INT_LBC_ERROR: u32 = 1 << 8;
    pub const INT_HB_SHORT: u32 = 1 << 9;
    pub const INT_CFG_MISMATCH: u32 = 1 << 10;
    pub const INT_ALL: u32 = (1 << 11) - 1;
    pub const INT_FAULTS: u32 = INT_SRC0_FIFO_OF
        | INT_FRAME_ERROR
        | INT_FRAME_LOST
        | INT_DDR_RW_ERROR
        | INT_LBC_ERROR
        | INT_HB_SHORT
        | INT_CFG_MISMATCH;
}

pub mod vipp {
    use tock_registers::register_bitfields;

    pub mod off {
        pub const EN: u32 = 0x000;
        pub const MODE: u32 = 0x004;
        pub const IN_SIZE: u32 = 0x008;
        pub const CROP_START: u32 = 0x00c;
        pub const CROP_SIZE: u32 = 0x010;
        pub const SC_CFG: u32 = 0x014;
        pub const SC_WEIGHT: u32 = 0x018;
        pub const OUT_SIZE: u32 = 0x01c;
        pub const OSD_CFG: u32 = 0x020;
        pub const OSD_BM_ADDR: u32 = 0x024;
        pub const OSD_PARA_ADDR: u32 = 0x028;
        pub const OSD_CV_ADDR: u32 = 0x02c;
    }

    register_bitfields![u32,
        pub VIPP_EN [
            EN OFFSET(0) NUMBITS(1) [],
            OSD_OV_EN OFFSET(1) NUMBITS(1) [],
            OSD_CV_EN OFFSET(2) NUMBITS(1) []
        ],
        pub MODE [
            OUT_FMT OFFSET(0) NUMBITS(2) [
                Yuv420 = 0,
                Yuv422 = 1,
                Raw = 2
            ],
            SCALER_EN OFFSET(4) NUMBITS(1) []
        ],
        pub SC_CFG [
            XRATIO OFFSET(0) NUMBITS(13) [],
            YRATIO OFFSET(16) NUMBITS(13) []
        ],
        pub SC_WEIGHT [
            SHIFT OFFSET(0) NUMBITS(5) []
        ],
        pub OSD_CFG [
            OV_NUM OFFSET(0) NUMBITS(7) [],
            CV_NUM OFFSET(8) NUMBITS(4) [],
            ALPHA OFFSET(16) NUMBITS(8) []
        ],
        pub START [
            HOR OFFSET(0) NUMBITS(13) [],
            VER OFFSET(16) NUMBITS(13) []
        ]
    ];
}

pub mod dma {
    use tock_registers::register_bitfields;

    pub mod off {
        pub const EN: u32 = 0x000;
        pub const CFG: u32 = 0x004;
        pub const HSIZE: u32 = 0x008;
        pub const VSIZE: u32 = 0x00c;
        pub const STRIDE: u32 = 0x010;
        pub const BUF_Y: u32 = 0x020;
        pub const BUF_CB: u32 = 0x024;
        pub const BUF_CR: u32 = 0x028;
        pub const INT_EN: u32 = 0x030;
        pub const INT_STA: u32 = 0x034;
    }

    register_bitfields![u32,
        pub DMA_EN [
            EN OFFSET(0) NUMBITS(1) [],
            CLK_EN OFFSET(1) NUMBITS(1) []
        ],
        pub CFG [
            FMT OFFSET(0) NUMBITS(4) [],
            MODE OFFSET(8) NUMBITS(2) [
                Video = 0,
                Image = 1,
                Online = 2
            ],
            LBC OFFSET(12) NUMBITS(1) []
        ],
        pub STRIDE [
            Y OFFSET(0) NUMBITS(16) [],
            C OFFSET(16) NUMBITS(16) []
        ]
    ];

    pub const INT_CAPTURE_DONE: u32 = 1 << 0;
    pub const INT_FRAME_DONE: u32 = 1 << 1;
    pub const INT_BUF_OVERFLOW: u32 = 1 << 2;
    pub const INT_LINE_CNT: u32 = 1 << 3;
    pub const INT_VSYNC: u32 = 1 << 4;
    pub const INT_FIFO_OVERFLOW: u32 = 1 << 5;
    pub const INT_ADDR_NO_READY: u32 = 1 << 6;
    pub const INT_ALL: u32 = (1 << 7) - 1;
}
