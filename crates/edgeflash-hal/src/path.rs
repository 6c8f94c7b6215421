/// Partition path helper for block devices. Handles nvme/mmcblk `p` postfixing.
pub fn partition_path(disk: &str, num: u32) -> String {
    if disk.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{}p{}", disk, num)
    } else {
        format!("{}{}", disk, num)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_path_handles_digit_suffixed_disks() {
        assert_eq!(partition_path("/dev/nvme1n1", 1), "/dev/nvme1n1p1");
        assert_eq!(partition_path("/dev/mmcblk0", 2), "/dev/mmcblk0p2");
        assert_eq!(partition_path("/dev/sda", 1), "/dev/sda1");
    }
}
