use crate::types::Size;

/// Instance type used when a machine record does not name one.
pub const DEFAULT_SIZE: &str = "m1.small";

/// Availability zone used when a machine record does not name one.
pub const DEFAULT_PLACEMENT: &str = "us-east-1b";

const fn size(id: &'static str, name: &'static str, ram_mb: u32, disk_gb: u32) -> Size {
    Size {
        id,
        name,
        ram_mb,
        disk_gb,
    }
}

/// Known instance types. Local data; listing sizes never touches the network.
pub static CATALOG: &[Size] = &[
    size("t1.micro", "Micro Instance", 613, 0),
    size("m1.small", "Small Instance", 1740, 160),
    size("m1.medium", "Medium Instance", 3750, 410),
    size("m1.large", "Large Instance", 7680, 850),
    size("m1.xlarge", "Extra Large Instance", 15360, 1690),
    size("c1.medium", "High-CPU Medium Instance", 1740, 350),
    size("c1.xlarge", "High-CPU Extra Large Instance", 7168, 1690),
    size("m2.xlarge", "High-Memory Extra Large Instance", 17510, 420),
    size("m2.2xlarge", "High-Memory Double Extra Large Instance", 35021, 850),
    size("m2.4xlarge", "High-Memory Quadruple Extra Large Instance", 70042, 1690),
    size("cc1.4xlarge", "Cluster Compute Quadruple Extra Large Instance", 23552, 1690),
    size("t3.micro", "T3 Micro", 1024, 0),
    size("t3.small", "T3 Small", 2048, 0),
    size("t3.medium", "T3 Medium", 4096, 0),
    size("m5.large", "M5 Large", 8192, 0),
    size("m5.xlarge", "M5 Extra Large", 16384, 0),
    size("c5.large", "C5 Large", 4096, 0),
    size("c5.xlarge", "C5 Extra Large", 8192, 0),
];

/// Exact-match lookup in [`CATALOG`].
pub fn find(size_id: &str) -> Option<&'static Size> {
    CATALOG.iter().find(|s| s.id == size_id)
}
