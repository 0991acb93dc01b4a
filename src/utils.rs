use std::path::Path;

use config::{Environment, File};
use tracing::info;

use crate::error::VinError;
use crate::Config;

/// Round `v` up to a multiple of `align` (any non-zero alignment).
#[inline]
pub const fn align_up(v: u32, align: u32) -> u32 {
    v.div_ceil(align) * align
}

/// Round `v` down to a multiple of `align`.
#[inline]
pub const fn align_down(v: u32, align: u32) -> u32 {
    v / align * align
}

/// Load configuration: built-in defaults, then `path` (TOML) if given, then
/// `VIN__*` environment overrides (`VIN__CAPTURE__WIDTH=1280`).
pub fn load_config(path: Option<&Path>) -> Result<Config, config::ConfigError> {
    let defaults = config::Config::try_from(&Config::default())?;
    let mut builder = config::Config::builder().add_source(defaults);
    if let Some(path) = path {
        info!("Loading configuration from {}", path.display());
        builder = builder.add_source(File::from(path).required(true));
    }
    builder
        .add_source(Environment::with_prefix("VIN").separator("__"))
        .build()?
        .try_deserialize()
}

/// Check a loaded configuration against its platform before building a graph.
pub fn validate_config(cfg: &Config) -> Result<(), VinError> {
    let plat = crate::platform::PlatformDesc::lookup(&cfg.platform)?;
    for v in &cfg.video {
        if v.sensor >= cfg.sensors.len() {
            return Err(VinError::NoDevice {
                kind: "sensor",
                id: v.sensor,
            });
        }
        let checks = [
            ("csi", v.csi, plat.regs.parser.count),
            ("isp", v.isp, plat.regs.isp.count),
            ("vipp", v.vipp, plat.regs.vipp.count),
            ("dma", v.id, plat.regs.dma.count),
        ];
        for (kind, id, count) in checks {
            if id >= count {
                return Err(VinError::NoDevice { kind, id });
            }
        }
        if let Some(m) = v.mipi {
            if m >= plat.regs.mipi.count {
                return Err(VinError::NoDevice { kind: "mipi", id: m });
            }
        }
        if let Some(t) = v.tdm {
            if t >= plat.regs.tdm.count {
                return Err(VinError::NoDevice { kind: "tdm", id: t });
            }
        }
        if v.isp_channel >= plat.isp_channels {
            return Err(VinError::InvalidArgument("isp channel out of range"));
        }
    }
    Ok(())
}
