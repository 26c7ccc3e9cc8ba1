// SPDX-FileCopyrightText: 2022-2025 The otakit developers
// SPDX-License-Identifier: GPL-3.0-only

//! Emitter for recovery-replayable (edify) install scripts.

use std::fmt::Write as _;

/// Builds an updater-script line by line. Every statement is terminated when
/// it is appended; there is no buffering of partial expressions.
#[derive(Debug, Default)]
pub struct EdifyScript {
    lines: Vec<String>,
}

impl EdifyScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw statement. Used by callers that need constructs without a
    /// dedicated helper.
    pub fn emit(&mut self, statement: impl Into<String>) {
        self.lines.push(statement.into());
    }

    pub fn comment(&mut self, text: &str) {
        self.lines.push(format!("# {text}"));
    }

    /// Assert that the package runs on the expected device.
    pub fn assert_device(&mut self, device: &str) {
        self.emit(format!(
            "getprop(\"ro.product.device\") == \"{device}\" || \
             abort(\"E3004: This package is for \\\"{device}\\\" devices; this is a \\\"\" + \
             getprop(\"ro.product.device\") + \"\\\".\");"
        ));
    }

    /// Assert that the device currently runs one of the given fingerprints.
    pub fn assert_some_fingerprint(&mut self, fingerprints: &[&str]) {
        assert!(!fingerprints.is_empty(), "No fingerprints to assert");

        let mut statement = String::new();

        for fingerprint in fingerprints {
            let _ = write!(
                statement,
                "getprop(\"ro.build.fingerprint\") == \"{fingerprint}\" || "
            );
        }

        let _ = write!(
            statement,
            "abort(\"E3001: Package expects build fingerprint of {}; this device has \" + \
             getprop(\"ro.build.fingerprint\") + \".\");",
            fingerprints.join(" or "),
        );

        self.emit(statement);
    }

    pub fn print(&mut self, message: &str) {
        self.emit(format!("ui_print(\"{message}\");"));
    }

    pub fn show_progress(&mut self, fraction: f64, duration: u32) {
        self.emit(format!("show_progress({fraction:.6}, {duration});"));
    }

    pub fn set_progress(&mut self, fraction: f64) {
        self.emit(format!("set_progress({fraction:.6});"));
    }

    /// Check that /cache has enough scratch space for patching.
    pub fn cache_free_space_check(&mut self, amount: u64) {
        self.emit(format!(
            "apply_patch_space({amount}) || abort(\"E1013: Not enough free space on \
             /cache to apply patches.\");"
        ));
    }

    /// Write a full image from the package to a block device.
    pub fn write_raw_image(&mut self, entry: &str, device: &str) {
        self.emit(format!("package_extract_file(\"{entry}\", \"{device}\");"));
    }

    pub fn block_image_verify(&mut self, partition: &str, device: &str) {
        self.emit(format!(
            "block_image_verify(\"{device}\", \
             package_extract_file(\"{partition}.transfer.list\"), \
             \"{partition}.new.dat\", \"{partition}.patch.dat\") || \
             abort(\"E3005: {partition} partition has unexpected contents.\");"
        ));
    }

    pub fn block_image_update(&mut self, partition: &str, device: &str) {
        self.emit(format!(
            "block_image_update(\"{device}\", \
             package_extract_file(\"{partition}.transfer.list\"), \
             \"{partition}.new.dat\", \"{partition}.patch.dat\") || \
             abort(\"E1001: Failed to update {partition} image.\");"
        ));
    }

    /// Verify a block range against a SHA-1. Used for the journaling-fs first
    /// block check on incremental installs.
    pub fn range_sha1_check(&mut self, device: &str, raw_ranges: &str, sha1: &str, message: &str) {
        self.emit(format!(
            "(range_sha1(\"{device}\", \"{raw_ranges}\") == \"{sha1}\") || \
             abort(\"{message}\");"
        ));
    }

    pub fn set_stage(&mut self, bcb_device: &str, stage: &str) {
        self.emit(format!("set_stage(\"{bcb_device}\", \"{stage}\");"));
    }

    pub fn reboot_now(&mut self, bcb_device: &str, target: &str) {
        self.emit(format!("reboot_now(\"{bcb_device}\", \"{target}\");"));
    }

    pub fn finish(self) -> String {
        let mut out = self.lines.join("\n");
        out.push('\n');
        out
    }
}

/// States of the two-step install, as persisted in the bootloader control
/// block between reboots. The stage strings are shared by the full and
/// incremental package variants and must never diverge.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TwoStepStage {
    /// Nothing staged yet; the package is running under the old recovery.
    Entry,
    /// The new recovery image has been staged into the boot partition.
    RecoveryStaged,
    /// Running under the new recovery; apply the real update.
    FinalInstall,
}

impl TwoStepStage {
    pub fn bcb_value(self) -> &'static str {
        match self {
            Self::Entry => "",
            Self::RecoveryStaged => "2/3",
            Self::FinalInstall => "3/3",
        }
    }

    /// The fixed transition table. `Entry` stages the new recovery into boot
    /// and reboots, `RecoveryStaged` installs the real recovery and reboots,
    /// and `FinalInstall` applies the update and clears the control block.
    pub fn next(self) -> Self {
        match self {
            Self::Entry => Self::RecoveryStaged,
            Self::RecoveryStaged => Self::FinalInstall,
            Self::FinalInstall => Self::Entry,
        }
    }
}

/// Devices involved in the two-step protocol.
#[derive(Clone, Debug)]
pub struct TwoStepDevices {
    /// Bootloader control block holding the persisted stage.
    pub bcb: String,
    /// Boot partition, temporarily overwritten with the new recovery.
    pub boot: String,
    /// Recovery partition, receiving the real recovery image.
    pub recovery: String,
}

/// Emit the two-step dispatch around `install_body`. Updates to the main
/// partitions are installed by code from the new recovery build, avoiding
/// mismatched kernel/recovery combinations while flashing.
pub fn emit_two_step(
    script: &mut EdifyScript,
    devices: &TwoStepDevices,
    install_body: impl FnOnce(&mut EdifyScript),
) {
    let staged = TwoStepStage::RecoveryStaged;
    let final_install = TwoStepStage::FinalInstall;
    let entry = TwoStepStage::Entry;

    script.emit(format!(
        "if get_stage(\"{}\") == \"{}\" then",
        devices.bcb,
        staged.bcb_value(),
    ));
    script.comment("Stage 2/3: Install the new recovery image.");
    script.print("Installing new recovery image...");
    script.write_raw_image("recovery.img", &devices.recovery);
    script.set_stage(&devices.bcb, staged.next().bcb_value());
    script.reboot_now(&devices.bcb, "");

    script.emit(format!(
        "else if get_stage(\"{}\") == \"{}\" then",
        devices.bcb,
        final_install.bcb_value(),
    ));
    script.comment("Stage 3/3: Apply the update.");
    install_body(script);
    script.set_stage(&devices.bcb, final_install.next().bcb_value());

    script.emit("else");
    script.comment("Stage 1/3: Stage the new recovery image into the boot partition.");
    script.print("Staging new recovery image...");
    script.write_raw_image("recovery.img", &devices.boot);
    script.set_stage(&devices.bcb, entry.next().bcb_value());
    script.reboot_now(&devices.bcb, "");
    script.emit("endif;");
    script.emit("endif;");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_devices() -> TwoStepDevices {
        TwoStepDevices {
            bcb: "/dev/block/by-name/misc".to_owned(),
            boot: "/dev/block/by-name/boot".to_owned(),
            recovery: "/dev/block/by-name/recovery".to_owned(),
        }
    }

    #[test]
    fn stage_transitions() {
        assert_eq!(TwoStepStage::Entry.bcb_value(), "");
        assert_eq!(TwoStepStage::Entry.next(), TwoStepStage::RecoveryStaged);
        assert_eq!(TwoStepStage::RecoveryStaged.bcb_value(), "2/3");
        assert_eq!(
            TwoStepStage::RecoveryStaged.next(),
            TwoStepStage::FinalInstall
        );
        assert_eq!(TwoStepStage::FinalInstall.bcb_value(), "3/3");
        assert_eq!(TwoStepStage::FinalInstall.next(), TwoStepStage::Entry);
    }

    fn two_step_script(body_partition: &str) -> String {
        let mut script = EdifyScript::new();
        let partition = body_partition.to_owned();

        emit_two_step(&mut script, &test_devices(), |s| {
            s.block_image_update(&partition, "/dev/block/by-name/part");
        });

        script.finish()
    }

    #[test]
    fn two_step_structure_is_shared() {
        let full = two_step_script("system");
        let incremental = two_step_script("vendor");

        for script in [&full, &incremental] {
            assert!(script.contains("get_stage(\"/dev/block/by-name/misc\") == \"2/3\""));
            assert!(script.contains("get_stage(\"/dev/block/by-name/misc\") == \"3/3\""));
            assert!(script.contains("set_stage(\"/dev/block/by-name/misc\", \"2/3\");"));
            assert!(script.contains("set_stage(\"/dev/block/by-name/misc\", \"3/3\");"));
            assert!(script.contains("set_stage(\"/dev/block/by-name/misc\", \"\");"));
        }

        // Identical scaffolding modulo the install body.
        let strip = |s: &str| {
            s.lines()
                .filter(|l| !l.contains("block_image_update"))
                .collect::<Vec<_>>()
                .join("\n")
        };
        assert_eq!(strip(&full), strip(&incremental));

        // The new recovery lands in boot first, the real one in recovery.
        let stage1 = full.find("Stage 1/3").unwrap();
        let boot_write = full
            .find("package_extract_file(\"recovery.img\", \"/dev/block/by-name/boot\");")
            .unwrap();
        assert!(boot_write > stage1);
    }

    #[test]
    fn fingerprint_assert() {
        let mut script = EdifyScript::new();
        script.assert_some_fingerprint(&["fp/a", "fp/b"]);
        let out = script.finish();

        assert!(out.contains("getprop(\"ro.build.fingerprint\") == \"fp/a\""));
        assert!(out.contains("getprop(\"ro.build.fingerprint\") == \"fp/b\""));
        assert!(out.contains("abort(\"E3001"));
    }
}
