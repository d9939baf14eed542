//! page - доступ к полям страницы по фиксированным смещениям (big-endian).
//!
//! Страница неизменяема после чтения; здесь только чтение полей и
//! инициализация заголовочной страницы нового табличного пространства.

use anyhow::Result;
use byteorder::{BigEndian, ByteOrder};

use crate::consts::{
    DICT_TF_COMPACT, DICT_TF_FORMAT_SHIFT, DICT_TF_FORMAT_ZIP, DICT_TF_ZSSIZE_MASK,
    DICT_TF_ZSSIZE_SHIFT, FIL_PAGE_LSN, FIL_PAGE_OFFSET, FIL_PAGE_SPACE_ID, FSP_HEADER_OFFSET,
    FSP_SIZE, FSP_SPACE_FLAGS, FSP_SPACE_ID, PAGE_SIZE_SHIFT_MAX, PAGE_SIZE_SHIFT_MIN,
    PAGE_ZIP_MIN_SIZE, SYSTEM_SPACE_ID,
};
use crate::errors::format_err;

#[inline]
pub fn page_lsn(page: &[u8]) -> u64 {
    BigEndian::read_u64(&page[FIL_PAGE_LSN..FIL_PAGE_LSN + 8])
}

#[inline]
pub fn page_no(page: &[u8]) -> u32 {
    BigEndian::read_u32(&page[FIL_PAGE_OFFSET..FIL_PAGE_OFFSET + 4])
}

#[inline]
pub fn page_space_id(page: &[u8]) -> u32 {
    BigEndian::read_u32(&page[FIL_PAGE_SPACE_ID..FIL_PAGE_SPACE_ID + 4])
}

/// space_id из FSP-заголовка (страница 0).
#[inline]
pub fn fsp_space_id(page0: &[u8]) -> u32 {
    let off = FSP_HEADER_OFFSET + FSP_SPACE_ID;
    BigEndian::read_u32(&page0[off..off + 4])
}

/// Флаги пространства из FSP-заголовка (страница 0).
#[inline]
pub fn fsp_flags(page0: &[u8]) -> u32 {
    let off = FSP_HEADER_OFFSET + FSP_SPACE_FLAGS;
    BigEndian::read_u32(&page0[off..off + 4])
}

#[inline]
pub fn is_system_space(space_id: u32) -> bool {
    space_id == SYSTEM_SPACE_ID
}

/// Проверка размера страницы: степень двойки в [1 KiB, 64 KiB].
pub fn validate_page_size(page_size: usize) -> Result<u32> {
    if page_size == 0 || !page_size.is_power_of_two() {
        return Err(format_err(format!(
            "unsupported page size {} (not a power of two)",
            page_size
        )));
    }
    let shift = page_size.trailing_zeros();
    if !(PAGE_SIZE_SHIFT_MIN..=PAGE_SIZE_SHIFT_MAX).contains(&shift) {
        return Err(format_err(format!(
            "unsupported page size {} (allowed 1KiB..64KiB)",
            page_size
        )));
    }
    Ok(shift)
}

/// Сжатый размер страницы из флагов (0 - пространство не сжато).
pub fn flags_to_zip_size(flags: u32) -> usize {
    let ssize = (flags & DICT_TF_ZSSIZE_MASK) >> DICT_TF_ZSSIZE_SHIFT;
    if ssize == 0 {
        0
    } else {
        PAGE_ZIP_MIN_SIZE << ssize
    }
}

/// Флаги для нового пространства с данным zip_size (0 - несжатое).
pub fn zip_size_to_flags(zip_size: usize) -> Result<u32> {
    if zip_size == 0 {
        return Ok(0);
    }
    validate_page_size(zip_size)?;
    let ssize = (zip_size / PAGE_ZIP_MIN_SIZE).trailing_zeros();
    let flags = (ssize << DICT_TF_ZSSIZE_SHIFT)
        | DICT_TF_COMPACT
        | (DICT_TF_FORMAT_ZIP << DICT_TF_FORMAT_SHIFT);
    debug_assert_eq!(flags_to_zip_size(flags), zip_size);
    Ok(flags)
}

/// Инициализировать заголовочную страницу (page 0) нового пространства.
pub fn init_header_page(page: &mut [u8], space_id: u32, size_pages: u32, flags: u32) {
    for b in page.iter_mut() {
        *b = 0;
    }
    BigEndian::write_u32(&mut page[FIL_PAGE_OFFSET..FIL_PAGE_OFFSET + 4], 0);
    BigEndian::write_u32(
        &mut page[FIL_PAGE_SPACE_ID..FIL_PAGE_SPACE_ID + 4],
        space_id,
    );
    let fsp = FSP_HEADER_OFFSET;
    BigEndian::write_u32(
        &mut page[fsp + FSP_SPACE_ID..fsp + FSP_SPACE_ID + 4],
        space_id,
    );
    BigEndian::write_u32(&mut page[fsp + FSP_SIZE..fsp + FSP_SIZE + 4], size_pages);
    BigEndian::write_u32(
        &mut page[fsp + FSP_SPACE_FLAGS..fsp + FSP_SPACE_FLAGS + 4],
        flags,
    );
}

/// Собрать страницу с заданными полями (тесты и симуляторы сервера).
pub fn build_page(page_size: usize, space_id: u32, page_no_v: u32, lsn: u64, fill: u8) -> Vec<u8> {
    let mut p = vec![fill; page_size];
    BigEndian::write_u32(&mut p[FIL_PAGE_OFFSET..FIL_PAGE_OFFSET + 4], page_no_v);
    BigEndian::write_u64(&mut p[FIL_PAGE_LSN..FIL_PAGE_LSN + 8], lsn);
    BigEndian::write_u32(&mut p[FIL_PAGE_SPACE_ID..FIL_PAGE_SPACE_ID + 4], space_id);
    p
}
