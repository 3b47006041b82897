// 上传并发度启发式
//
// 受限条件（蜂窝网络、低电量、过热降频）下向 1 收敛，
// 无压力的 Wi-Fi / 供电环境回到上限

/// 默认并发上限
pub const DEFAULT_PARALLELISM_CEILING: usize = 4;

/// 网络类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkClass {
    Wifi,
    Cellular,
    Offline,
}

/// 设备状态输入
#[derive(Debug, Clone, Copy)]
pub struct DeviceConditions {
    pub network: NetworkClass,
    pub low_battery: bool,
    pub thermal_throttling: bool,
}

impl DeviceConditions {
    /// 无压力的 Wi-Fi 环境
    pub fn unconstrained_wifi() -> Self {
        Self {
            network: NetworkClass::Wifi,
            low_battery: false,
            thermal_throttling: false,
        }
    }
}

impl Default for DeviceConditions {
    fn default() -> Self {
        Self::unconstrained_wifi()
    }
}

/// 根据设备状态推荐并发度，始终在 1..=ceiling 内
pub fn recommended_parallelism(ceiling: usize, conditions: &DeviceConditions) -> usize {
    let ceiling = ceiling.max(1);
    match conditions.network {
        // 离线时队列会挂起，保底 1 以便恢复后立即有进度
        NetworkClass::Offline => 1,
        _ if conditions.low_battery || conditions.thermal_throttling => 1,
        NetworkClass::Cellular => (ceiling / 2).max(1),
        NetworkClass::Wifi => ceiling,
    }
}
