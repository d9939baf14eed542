//! redo/block - поля блока redo log (512 байт, big-endian).
//!
//! Раскладка:
//!   [0..4)    hdr_no (бит 31 - флаг flush)
//!   [4..6)    data_len (включая заголовок; 512 - блок заполнен)
//!   [6..8)    first_rec_group
//!   [8..12)   checkpoint_no
//!   [12..508) данные
//!   [508..512) CRC32C от [0..508)

use byteorder::{BigEndian, ByteOrder};

use crate::consts::{
    LOG_BLOCK_CHECKPOINT_NO, LOG_BLOCK_CHECKSUM, LOG_BLOCK_FIRST_REC_GROUP,
    LOG_BLOCK_FLUSH_BIT_MASK, LOG_BLOCK_HDR_DATA_LEN, LOG_BLOCK_HDR_NO, LOG_BLOCK_HDR_SIZE,
    LOG_BLOCK_NO_MASK, LOG_BLOCK_SIZE,
};

/// Номер блока, в котором лежит `lsn`.
#[inline]
pub fn lsn_to_block_no(lsn: u64) -> u32 {
    (((lsn / LOG_BLOCK_SIZE as u64) & LOG_BLOCK_NO_MASK) + 1) as u32
}

/// Сколько блоков помещается в группу ёмкостью `capacity` (для диагностики
/// переполнения лога).
#[inline]
pub fn group_block_capacity(capacity: u64) -> u32 {
    lsn_to_block_no(capacity) - 1
}

#[inline]
pub fn hdr_no(b: &[u8]) -> u32 {
    BigEndian::read_u32(&b[LOG_BLOCK_HDR_NO..LOG_BLOCK_HDR_NO + 4]) & !LOG_BLOCK_FLUSH_BIT_MASK
}

#[inline]
pub fn flush_bit(b: &[u8]) -> bool {
    BigEndian::read_u32(&b[LOG_BLOCK_HDR_NO..LOG_BLOCK_HDR_NO + 4]) & LOG_BLOCK_FLUSH_BIT_MASK != 0
}

#[inline]
pub fn data_len(b: &[u8]) -> usize {
    BigEndian::read_u16(&b[LOG_BLOCK_HDR_DATA_LEN..LOG_BLOCK_HDR_DATA_LEN + 2]) as usize
}

#[inline]
pub fn first_rec_group(b: &[u8]) -> u16 {
    BigEndian::read_u16(&b[LOG_BLOCK_FIRST_REC_GROUP..LOG_BLOCK_FIRST_REC_GROUP + 2])
}

#[inline]
pub fn checkpoint_no(b: &[u8]) -> u32 {
    BigEndian::read_u32(&b[LOG_BLOCK_CHECKPOINT_NO..LOG_BLOCK_CHECKPOINT_NO + 4])
}

#[inline]
pub fn stored_checksum(b: &[u8]) -> u32 {
    BigEndian::read_u32(&b[LOG_BLOCK_CHECKSUM..LOG_BLOCK_CHECKSUM + 4])
}

#[inline]
pub fn calc_checksum(b: &[u8]) -> u32 {
    crc32c::crc32c(&b[..LOG_BLOCK_CHECKSUM])
}

#[inline]
pub fn checksum_ok(b: &[u8]) -> bool {
    stored_checksum(b) == calc_checksum(b)
}

/// Блок, в который сервер ещё ни разу не писал.
#[inline]
pub fn is_unwritten(b: &[u8]) -> bool {
    b.iter().all(|&x| x == 0)
}

/// Проставить контрольную сумму.
pub fn seal(b: &mut [u8]) {
    let crc = calc_checksum(b);
    BigEndian::write_u32(&mut b[LOG_BLOCK_CHECKSUM..LOG_BLOCK_CHECKSUM + 4], crc);
}

/// Собрать блок с корректным номером для `block_lsn` (выровнен по 512).
pub fn build(block_lsn: u64, data_len_v: usize, checkpoint_no_v: u32, flush: bool, fill: u8) -> Vec<u8> {
    debug_assert_eq!(block_lsn % LOG_BLOCK_SIZE as u64, 0);
    debug_assert!((LOG_BLOCK_HDR_SIZE..=LOG_BLOCK_SIZE).contains(&data_len_v));
    let mut b = vec![0u8; LOG_BLOCK_SIZE];
    let mut no = lsn_to_block_no(block_lsn);
    if flush {
        no |= LOG_BLOCK_FLUSH_BIT_MASK;
    }
    BigEndian::write_u32(&mut b[LOG_BLOCK_HDR_NO..LOG_BLOCK_HDR_NO + 4], no);
    BigEndian::write_u16(
        &mut b[LOG_BLOCK_HDR_DATA_LEN..LOG_BLOCK_HDR_DATA_LEN + 2],
        data_len_v as u16,
    );
    BigEndian::write_u16(
        &mut b[LOG_BLOCK_FIRST_REC_GROUP..LOG_BLOCK_FIRST_REC_GROUP + 2],
        LOG_BLOCK_HDR_SIZE as u16,
    );
    BigEndian::write_u32(
        &mut b[LOG_BLOCK_CHECKPOINT_NO..LOG_BLOCK_CHECKPOINT_NO + 4],
        checkpoint_no_v,
    );
    for x in &mut b[LOG_BLOCK_HDR_SIZE..data_len_v.min(LOG_BLOCK_CHECKSUM)] {
        *x = fill;
    }
    seal(&mut b);
    b
}
