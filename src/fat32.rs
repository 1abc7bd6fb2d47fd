//! Just enough FAT32 to mount and create an empty volume

use crate::bus::SdBus;
use crate::card::{Block, SdSpi, SD_BLOCK_LEN};
use crate::errors::{
    BadGeometrySnafu, BadSectorSizeSnafu, BadSignatureSnafu, FormatError, FormatInitSnafu, LayoutError, MountSnafu,
    NotConfirmedSnafu, NotFat32Snafu, ReadBootSnafu, WriteStepSnafu,
};
use log::{debug, info, warn};
use snafu::prelude::*;

/// Bytes per sector, the only size supported
pub const FAT_BYTES_PER_SECTOR: u16 = 512;

/// Sectors per cluster used when formatting
pub const FAT_SECTORS_PER_CLUSTER: u8 = 8;

/// Reserved sectors used when formatting
pub const FAT_RESERVED_SECTORS: u16 = 32;

/// Number of FAT copies used when formatting
pub const FAT_NUM_FATS: u8 = 2;

/// Media descriptor for fixed disks
pub const FAT_MEDIA_FIXED: u8 = 0xF8;

/// Size of one FAT32 entry in bytes
pub const FAT_ENTRY_LEN: u32 = 4;

/// Size of one directory entry in bytes
pub const FAT_DIR_ENTRY_LEN: u32 = 32;

/// End of cluster chain marker
pub const FAT_EOC: u32 = 0x0FFF_FFFF;

/// Signature at the end of every boot sector
pub const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];

/// Offset of the boot signature
pub const BOOT_SIGNATURE_OFFSET: usize = 510;

/// Extended boot signature, marks the volume id/label/type fields as valid
pub const BOOT_EXT_SIGNATURE: u8 = 0x29;

/// What the type tag starts with on FAT32 volumes
pub const FAT32_TAG: &[u8; 5] = b"FAT32";

/// Entries of one FAT sector
type FatSector = [u32; SD_BLOCK_LEN / FAT_ENTRY_LEN as usize];

/// The FAT32 boot sector. Serialized field by field, little endian, at the
/// offsets of the BIOS parameter block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootSector {
    pub jmp_boot: [u8; 3],
    pub oem_name: [u8; 8],
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub num_fats: u8,
    pub root_entry_count: u16,
    pub total_sectors_16: u16,
    pub media: u8,
    pub fat_size_16: u16,
    pub sectors_per_track: u16,
    pub num_heads: u16,
    pub hidden_sectors: u32,
    pub total_sectors_32: u32,
    pub fat_size_32: u32,
    pub ext_flags: u16,
    pub fs_version: u16,
    pub root_cluster: u32,
    pub fs_info: u16,
    pub backup_boot_sector: u16,
    pub reserved: [u8; 12],
    pub drive_number: u8,
    pub reserved1: u8,
    pub boot_signature: u8,
    pub volume_id: u32,
    pub volume_label: [u8; 11],
    pub fs_type: [u8; 8],
    /// Bytes 510-511
    pub signature: [u8; 2],
}

fn array<const N: usize>(data: &Block, offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&data[offset..offset + N]);
    out
}

fn le16(data: &Block, offset: usize) -> u16 {
    u16::from_le_bytes(array(data, offset))
}

fn le32(data: &Block, offset: usize) -> u32 {
    u32::from_le_bytes(array(data, offset))
}

impl BootSector {
    pub fn from_bytes(data: &Block) -> Self {
        Self {
            jmp_boot: array(data, 0),
            oem_name: array(data, 3),
            bytes_per_sector: le16(data, 11),
            sectors_per_cluster: data[13],
            reserved_sectors: le16(data, 14),
            num_fats: data[16],
            root_entry_count: le16(data, 17),
            total_sectors_16: le16(data, 19),
            media: data[21],
            fat_size_16: le16(data, 22),
            sectors_per_track: le16(data, 24),
            num_heads: le16(data, 26),
            hidden_sectors: le32(data, 28),
            total_sectors_32: le32(data, 32),
            fat_size_32: le32(data, 36),
            ext_flags: le16(data, 40),
            fs_version: le16(data, 42),
            root_cluster: le32(data, 44),
            fs_info: le16(data, 48),
            backup_boot_sector: le16(data, 50),
            reserved: array(data, 52),
            drive_number: data[64],
            reserved1: data[65],
            boot_signature: data[66],
            volume_id: le32(data, 67),
            volume_label: array(data, 71),
            fs_type: array(data, 82),
            signature: array(data, BOOT_SIGNATURE_OFFSET),
        }
    }

    /// Serialize into a whole block, boot code area zeroed
    pub fn to_bytes(&self) -> Block {
        let mut data = [0u8; SD_BLOCK_LEN];

        data[0..3].copy_from_slice(&self.jmp_boot);
        data[3..11].copy_from_slice(&self.oem_name);
        data[11..13].copy_from_slice(&self.bytes_per_sector.to_le_bytes());
        data[13] = self.sectors_per_cluster;
        data[14..16].copy_from_slice(&self.reserved_sectors.to_le_bytes());
        data[16] = self.num_fats;
        data[17..19].copy_from_slice(&self.root_entry_count.to_le_bytes());
        data[19..21].copy_from_slice(&self.total_sectors_16.to_le_bytes());
        data[21] = self.media;
        data[22..24].copy_from_slice(&self.fat_size_16.to_le_bytes());
        data[24..26].copy_from_slice(&self.sectors_per_track.to_le_bytes());
        data[26..28].copy_from_slice(&self.num_heads.to_le_bytes());
        data[28..32].copy_from_slice(&self.hidden_sectors.to_le_bytes());
        data[32..36].copy_from_slice(&self.total_sectors_32.to_le_bytes());
        data[36..40].copy_from_slice(&self.fat_size_32.to_le_bytes());
        data[40..42].copy_from_slice(&self.ext_flags.to_le_bytes());
        data[42..44].copy_from_slice(&self.fs_version.to_le_bytes());
        data[44..48].copy_from_slice(&self.root_cluster.to_le_bytes());
        data[48..50].copy_from_slice(&self.fs_info.to_le_bytes());
        data[50..52].copy_from_slice(&self.backup_boot_sector.to_le_bytes());
        data[52..64].copy_from_slice(&self.reserved);
        data[64] = self.drive_number;
        data[65] = self.reserved1;
        data[66] = self.boot_signature;
        data[67..71].copy_from_slice(&self.volume_id.to_le_bytes());
        data[71..82].copy_from_slice(&self.volume_label);
        data[82..90].copy_from_slice(&self.fs_type);
        data[BOOT_SIGNATURE_OFFSET..].copy_from_slice(&self.signature);

        data
    }

    /// A fresh boot sector for the given format parameters
    pub fn fat32(config: &FormatConfig) -> Self {
        Self {
            jmp_boot: [0xEB, 0x58, 0x90],
            oem_name: config.oem_name,
            bytes_per_sector: FAT_BYTES_PER_SECTOR,
            sectors_per_cluster: FAT_SECTORS_PER_CLUSTER,
            reserved_sectors: FAT_RESERVED_SECTORS,
            num_fats: FAT_NUM_FATS,
            // Both 0 on FAT32
            root_entry_count: 0,
            total_sectors_16: 0,
            media: FAT_MEDIA_FIXED,
            fat_size_16: 0,
            sectors_per_track: 63,
            num_heads: 255,
            hidden_sectors: 0,
            total_sectors_32: config.total_sectors,
            fat_size_32: config.fat_size_sectors(),
            ext_flags: 0,
            fs_version: 0,
            root_cluster: 2,
            fs_info: 1,
            backup_boot_sector: 6,
            reserved: [0; 12],
            drive_number: 0x80,
            reserved1: 0,
            boot_signature: BOOT_EXT_SIGNATURE,
            volume_id: config.volume_id,
            volume_label: config.volume_label,
            fs_type: *b"FAT32   ",
            signature: BOOT_SIGNATURE,
        }
    }

    /// Check the sector is one we can mount
    pub fn validate(&self) -> Result<(), LayoutError> {
        ensure!(
            self.bytes_per_sector == FAT_BYTES_PER_SECTOR,
            BadSectorSizeSnafu {
                bytes_per_sector: self.bytes_per_sector
            }
        );

        ensure!(
            self.signature == BOOT_SIGNATURE,
            BadSignatureSnafu {
                signature: u16::from_be_bytes(self.signature)
            }
        );

        ensure!(
            &self.fs_type[..FAT32_TAG.len()] == FAT32_TAG,
            NotFat32Snafu {
                fs_type: self.fs_type
            }
        );

        Ok(())
    }
}

/// Where things live on a mounted volume, in sectors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeLayout {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub num_fats: u8,
    pub fat_size_sectors: u32,
    pub root_dir_sector: u32,
    pub data_start_sector: u32,
    pub total_sectors: u32,
    pub root_cluster: u32,
}

impl VolumeLayout {
    /// Work out the offsets of a boot sector. The root directory is treated
    /// as a fixed run of sectors after the FATs, which on FAT32 is empty
    /// since the root entry count is 0.
    ///
    /// Fails when an offset doesn't fit in 32 bits of sectors.
    pub fn from_boot_sector(boot: &BootSector) -> Result<Self, LayoutError> {
        let bytes_per_sector = boot.bytes_per_sector as u32;
        ensure!(
            bytes_per_sector > 0,
            BadSectorSizeSnafu {
                bytes_per_sector: boot.bytes_per_sector
            }
        );

        let root_dir_sector = (boot.num_fats as u32)
            .checked_mul(boot.fat_size_32)
            .and_then(|fats| fats.checked_add(boot.reserved_sectors as u32))
            .context(BadGeometrySnafu {
                num_fats: boot.num_fats,
                fat_size_sectors: boot.fat_size_32,
            })?;

        let root_dir_bytes = boot.root_entry_count as u32 * FAT_DIR_ENTRY_LEN;
        let data_start_sector = root_dir_sector
            .checked_add(root_dir_bytes.div_ceil(bytes_per_sector))
            .context(BadGeometrySnafu {
                num_fats: boot.num_fats,
                fat_size_sectors: boot.fat_size_32,
            })?;

        let total_sectors = match boot.total_sectors_16 {
            0 => boot.total_sectors_32,
            n => n as u32,
        };

        Ok(Self {
            bytes_per_sector: boot.bytes_per_sector,
            sectors_per_cluster: boot.sectors_per_cluster,
            reserved_sectors: boot.reserved_sectors,
            num_fats: boot.num_fats,
            fat_size_sectors: boot.fat_size_32,
            root_dir_sector,
            data_start_sector,
            total_sectors,
            root_cluster: boot.root_cluster,
        })
    }

    /// First sector of the first FAT
    pub fn first_fat_sector(&self) -> u32 {
        self.reserved_sectors as u32
    }

    /// Size of a cluster in bytes
    pub fn cluster_size(&self) -> u32 {
        self.bytes_per_sector as u32 * self.sectors_per_cluster as u32
    }
}

/// Parameters for `format` that aren't fixed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatConfig {
    /// Size of the volume. Not read from the card.
    pub total_sectors: u32,
    pub oem_name: [u8; 8],
    pub volume_label: [u8; 11],
    pub volume_id: u32,
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self {
            // 4MB
            total_sectors: 8192,
            oem_name: *b"PICO    ",
            volume_label: *b"PICO_SD_CAR",
            volume_id: 0x1234_5678,
        }
    }
}

impl FormatConfig {
    /// Number of clusters the data area can hold
    pub fn cluster_count(&self) -> u32 {
        self.total_sectors.saturating_sub(FAT_RESERVED_SECTORS as u32)
            / FAT_SECTORS_PER_CLUSTER as u32
    }

    /// Sectors needed for one FAT
    pub fn fat_size_sectors(&self) -> u32 {
        (self.cluster_count() * FAT_ENTRY_LEN).div_ceil(FAT_BYTES_PER_SECTOR as u32)
    }
}

/// The first sector of a new FAT: the media descriptor entry, the reserved
/// entry, and the root directory cluster marked as end of chain
fn new_fat_sector(media: u8, root_cluster: u32) -> Block {
    let mut entries: FatSector = [0; SD_BLOCK_LEN / FAT_ENTRY_LEN as usize];

    entries[0] = (0x0FFF_FF00 | media as u32).to_le();
    entries[root_cluster as usize] = FAT_EOC.to_le();

    bytemuck::cast(entries)
}

impl<B: SdBus> SdSpi<B> {
    /// Read block 0 and mount the volume on it
    ///
    /// Nothing stored is touched unless the boot sector is accepted.
    pub fn parse_boot_sector(&mut self) -> Result<VolumeLayout, FormatError> {
        let data = self.read_block(0).context(ReadBootSnafu)?;
        let boot = BootSector::from_bytes(&data);

        let layout = match boot.validate().and_then(|()| VolumeLayout::from_boot_sector(&boot)) {
            Ok(layout) => layout,
            Err(e) => {
                warn!("Boot sector rejected: {}", e);
                return Err(e.into());
            }
        };

        self.volume = Some(layout);

        info!(
            "FAT32 mounted: {} sectors/cluster, FAT at {}, root at {}, data at {}",
            layout.sectors_per_cluster,
            layout.first_fat_sector(),
            layout.root_dir_sector,
            layout.data_start_sector
        );

        Ok(layout)
    }

    /// Write an empty FAT32 volume and mount it
    ///
    /// Asking the user is up to the caller, pass whether they agreed. A
    /// failure half way leaves whatever was written on the card, start over
    /// from scratch in that case.
    pub fn format(&mut self, confirmed: bool) -> Result<VolumeLayout, FormatError> {
        ensure!(confirmed, NotConfirmedSnafu);

        if !self.state.ready {
            self.initialize().context(FormatInitSnafu)?;
        }

        let boot = BootSector::fat32(&self.config.format);
        let layout = VolumeLayout::from_boot_sector(&boot)?;
        let boot_block = boot.to_bytes();

        info!(
            "Formatting {} sectors, FAT size {}",
            boot.total_sectors_32, boot.fat_size_32
        );

        self.write_block(0, &boot_block)
            .context(WriteStepSnafu { step: "boot sector" })?;
        self.write_block(boot.backup_boot_sector as u32, &boot_block)
            .context(WriteStepSnafu {
                step: "backup boot sector",
            })?;

        let fat = new_fat_sector(boot.media, boot.root_cluster);
        let first_fat = layout.first_fat_sector();

        self.write_block(first_fat, &fat)
            .context(WriteStepSnafu { step: "first FAT" })?;
        self.write_block(first_fat + layout.fat_size_sectors, &fat)
            .context(WriteStepSnafu { step: "second FAT" })?;

        self.write_block(layout.root_dir_sector, &[0; SD_BLOCK_LEN])
            .context(WriteStepSnafu {
                step: "root directory",
            })?;

        debug!("Format written, remounting");

        match self.parse_boot_sector() {
            Ok(layout) => Ok(layout),
            Err(FormatError::Layout { source }) => {
                warn!("Filesystem created but could not be mounted");
                Err(source).context(MountSnafu)
            }
            Err(e) => Err(e),
        }
    }
}
