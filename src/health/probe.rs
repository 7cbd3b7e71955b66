//! 主机指标采集 - CPU、温度、内存、磁盘、网络、运行时长

use serde::Serialize;
use std::path::Path;
use sysinfo::{Components, Disks, Networks, System};
use tracing::debug;

/// 树莓派等 SoC 上 sysinfo 拿不到温度时的兜底
const THERMAL_ZONE: &str = "/sys/class/thermal/thermal_zone0/temp";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuStats {
    /// 百分比
    pub usage: f64,
    /// 摄氏度，无传感器时为 None
    pub temperature: Option<f64>,
    pub load_average: [f64; 3],
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    pub used: u64,
    pub total: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStats {
    pub rx: u64,
    pub tx: u64,
}

/// 一次采样结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStats {
    pub cpu: CpuStats,
    pub memory: UsageStats,
    pub disk: UsageStats,
    pub network: NetworkStats,
    pub uptime_sec: u64,
}

pub fn percentage(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}

/// 优先根分区，没有则取第一个
pub fn pick_root_disk(disks: &[(String, u64, u64)]) -> Option<UsageStats> {
    let (_, total, available) = disks
        .iter()
        .find(|(mount, _, _)| mount == "/")
        .or_else(|| disks.first())?;
    let used = total.saturating_sub(*available);
    Some(UsageStats {
        used,
        total: *total,
        percentage: percentage(used, *total),
    })
}

/// 从传感器列表里挑 CPU 温度
pub fn pick_cpu_temperature(sensors: &[(String, f32)]) -> Option<f64> {
    const HINTS: [&str; 4] = ["cpu", "package", "soc", "core"];

    let valid = || sensors.iter().filter(|(_, t)| t.is_finite() && *t > 0.0);
    valid()
        .find(|(label, _)| {
            let label = label.to_lowercase();
            HINTS.iter().any(|h| label.contains(h))
        })
        .or_else(|| valid().next())
        .map(|(_, t)| f64::from(*t))
}

/// thermal_zone 文件内容为毫摄氏度
pub fn parse_thermal_zone(content: &str) -> Option<f64> {
    let milli: f64 = content.trim().parse().ok()?;
    Some(milli / 1000.0)
}

fn read_thermal_zone(path: &Path) -> Option<f64> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|c| parse_thermal_zone(&c))
}

/// 主机指标采集器
///
/// CPU 使用率是两次刷新之间的差值，所以采集器需要长期持有。
pub struct SystemProbe {
    system: System,
    disks: Disks,
    networks: Networks,
    components: Components,
}

impl SystemProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            system,
            disks: Disks::new_with_refreshed_list(),
            networks: Networks::new_with_refreshed_list(),
            components: Components::new_with_refreshed_list(),
        }
    }

    /// 采样一次（会读取 /proc、/sys，阻塞）
    pub fn sample(&mut self) -> SystemStats {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        self.disks.refresh_list();
        self.networks.refresh();
        self.components.refresh();

        let sensors: Vec<(String, f32)> = self
            .components
            .iter()
            .map(|c| (c.label().to_string(), c.temperature()))
            .collect();
        let temperature =
            pick_cpu_temperature(&sensors).or_else(|| read_thermal_zone(Path::new(THERMAL_ZONE)));

        let load = System::load_average();
        let cpu = CpuStats {
            usage: f64::from(self.system.global_cpu_usage()),
            temperature,
            load_average: [load.one, load.five, load.fifteen],
        };

        let used = self.system.used_memory();
        let total = self.system.total_memory();
        let memory = UsageStats {
            used,
            total,
            percentage: percentage(used, total),
        };

        let disks: Vec<(String, u64, u64)> = self
            .disks
            .iter()
            .map(|d| {
                (
                    d.mount_point().to_string_lossy().into_owned(),
                    d.total_space(),
                    d.available_space(),
                )
            })
            .collect();
        let disk = pick_root_disk(&disks).unwrap_or_default();

        // 只取第一块非回环网卡，与单网口设备一致
        let network = self
            .networks
            .iter()
            .find(|(name, _)| name.as_str() != "lo")
            .map(|(_, data)| NetworkStats {
                rx: data.total_received(),
                tx: data.total_transmitted(),
            })
            .unwrap_or_default();

        let stats = SystemStats {
            cpu,
            memory,
            disk,
            network,
            uptime_sec: System::uptime(),
        };
        debug!(
            cpu = %format!("{:.1}%", stats.cpu.usage),
            memory = %format!("{:.1}%", stats.memory.percentage),
            disk = %format!("{:.1}%", stats.disk.percentage),
            temp = ?stats.cpu.temperature,
            "System stats"
        );
        stats
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage_handles_zero_total() {
        assert_eq!(percentage(5, 0), 0.0);
        assert_eq!(percentage(50, 200), 25.0);
    }

    #[test]
    fn test_pick_root_disk_prefers_root_mount() {
        let disks = vec![
            ("/boot".to_string(), 100, 90),
            ("/".to_string(), 1000, 250),
        ];
        let disk = pick_root_disk(&disks).unwrap();
        assert_eq!(disk.total, 1000);
        assert_eq!(disk.used, 750);
        assert_eq!(disk.percentage, 75.0);
    }

    #[test]
    fn test_pick_root_disk_falls_back_to_first() {
        let disks = vec![("/data".to_string(), 400, 100)];
        assert_eq!(pick_root_disk(&disks).unwrap().used, 300);
        assert!(pick_root_disk(&[]).is_none());
    }

    #[test]
    fn test_pick_cpu_temperature() {
        let sensors = vec![
            ("nvme Composite".to_string(), 41.0),
            ("coretemp Package id 0".to_string(), 63.5),
        ];
        assert_eq!(pick_cpu_temperature(&sensors), Some(63.5));

        let unlabeled = vec![("acpitz".to_string(), 48.0)];
        assert_eq!(pick_cpu_temperature(&unlabeled), Some(48.0));

        let broken = vec![("cpu_thermal".to_string(), f32::NAN)];
        assert_eq!(pick_cpu_temperature(&broken), None);
    }

    #[test]
    fn test_parse_thermal_zone() {
        assert_eq!(parse_thermal_zone("52000\n"), Some(52.0));
        assert_eq!(parse_thermal_zone("garbage"), None);
    }

    #[test]
    fn test_sample_reports_memory() {
        let mut probe = SystemProbe::new();
        let stats = probe.sample();
        assert!(stats.memory.total > 0);
        assert!(stats.memory.percentage <= 100.0);
    }
}
